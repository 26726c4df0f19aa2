//! Membership-restricted FedAvg
//!
//! Client i's next parameters are the unweighted parameter-wise mean over the
//! clients in row i of the membership matrix. An all-ones matrix is global
//! FedAvg; the identity is purely local training.

use fedclust_core::{ClientId, FedError, MembershipMatrix, ModelParams, Result, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What inactive clients contribute to their neighbours' averages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InactivePolicy {
    /// Inactive clients take part with their last known parameters
    #[default]
    ContributeStale,
    /// Only active clients (and the client itself) are averaged
    Exclude,
}

/// FedAvg restricted to each client's membership row
#[derive(Debug, Clone, Copy, Default)]
pub struct FederatedAggregator {
    inactive: InactivePolicy,
}

impl FederatedAggregator {
    pub fn new(inactive: InactivePolicy) -> Self {
        Self { inactive }
    }

    pub fn inactive_policy(&self) -> InactivePolicy {
        self.inactive
    }

    /// Average every client's parameters over its neighbourhood
    ///
    /// `active[j]` marks the clients that trained this round. Clients sharing
    /// the same neighbourhood receive the same averaged parameters.
    pub fn aggregate(
        &self,
        params: &[ModelParams],
        membership: &MembershipMatrix,
        active: &[bool],
    ) -> Result<Vec<ModelParams>> {
        let n = params.len();
        if membership.n() != n || active.len() != n {
            return Err(FedError::Config(format!(
                "aggregation over {} clients given a {}x{} membership and {} activity flags",
                n,
                membership.n(),
                membership.n(),
                active.len()
            )));
        }

        let mut cache: HashMap<Vec<ClientId>, ModelParams> = HashMap::new();
        let mut next = Vec::with_capacity(n);
        for client in 0..n {
            let neighbourhood = self.neighbourhood(client, membership, active);
            if neighbourhood.len() == 1 {
                next.push(params[client].clone());
                continue;
            }
            if let Some(avg) = cache.get(&neighbourhood) {
                next.push(avg.clone());
                continue;
            }
            let avg = average(client, &neighbourhood, params)?;
            cache.insert(neighbourhood, avg.clone());
            next.push(avg);
        }

        tracing::debug!(
            clients = n,
            distinct_neighbourhoods = cache.len(),
            policy = ?self.inactive,
            "Aggregated client parameters"
        );
        Ok(next)
    }

    fn neighbourhood(&self, client: ClientId, membership: &MembershipMatrix, active: &[bool]) -> Vec<ClientId> {
        membership
            .members(client)
            .into_iter()
            .filter(|&peer| match self.inactive {
                InactivePolicy::ContributeStale => true,
                InactivePolicy::Exclude => peer == client || active[peer],
            })
            .collect()
    }
}

/// Parameter-wise mean over `members`, summed in f64 in client-id order
fn average(client: ClientId, members: &[ClientId], params: &[ModelParams]) -> Result<ModelParams> {
    let own = &params[client];
    for &peer in members {
        if let Some(mismatch) = own.topology_mismatch(&params[peer]) {
            return Err(FedError::AggregationShape {
                client,
                peer,
                param: mismatch.param,
                expected: mismatch.expected,
                actual: mismatch.actual,
            });
        }
    }

    let count = members.len() as f64;
    let mut avg = ModelParams::new();
    for (name, tensor) in own.iter() {
        let mut sums = vec![0.0f64; tensor.len()];
        for &peer in members {
            // Topologies were checked above
            if let Some(theirs) = params[peer].get(name) {
                for (s, v) in sums.iter_mut().zip(theirs.data()) {
                    *s += *v as f64;
                }
            }
        }
        let data = sums.into_iter().map(|s| (s / count) as f32).collect();
        avg.insert(name, Tensor::new(tensor.shape().to_vec(), data)?);
    }
    Ok(avg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_params(values: [f32; 3]) -> ModelParams {
        ModelParams::new()
            .with("fc.weight", Tensor::new(vec![2], vec![values[0], values[1]]).unwrap())
            .with("fc.bias", Tensor::new(vec![1], vec![values[2]]).unwrap())
    }

    fn population() -> Vec<ModelParams> {
        vec![
            client_params([1.0, 2.0, 3.0]),
            client_params([3.0, 4.0, 5.0]),
            client_params([5.0, 6.0, 7.0]),
            client_params([7.0, 8.0, 9.0]),
        ]
    }

    #[test]
    fn test_single_cluster_is_global_mean() {
        let params = population();
        let out = FederatedAggregator::default()
            .aggregate(&params, &MembershipMatrix::ones(4), &[true; 4])
            .unwrap();
        let expected = client_params([4.0, 5.0, 6.0]);
        for p in &out {
            assert_eq!(p, &expected);
        }
    }

    #[test]
    fn test_identity_is_exact_copy() {
        let params = vec![
            client_params([0.1, 0.2, 0.3]),
            client_params([1e-7, -3.5, 2.25]),
        ];
        let out = FederatedAggregator::default()
            .aggregate(&params, &MembershipMatrix::identity(2), &[true, true])
            .unwrap();
        assert_eq!(out, params);
    }

    #[test]
    fn test_two_clusters() {
        let params = population();
        let membership = MembershipMatrix::from_labels(&[0, 0, 1, 1]);
        let out = FederatedAggregator::default()
            .aggregate(&params, &membership, &[true; 4])
            .unwrap();
        assert_eq!(out[0], client_params([2.0, 3.0, 4.0]));
        assert_eq!(out[1], out[0]);
        assert_eq!(out[2], client_params([6.0, 7.0, 8.0]));
    }

    #[test]
    fn test_exclude_inactive_peers() {
        let params = population();
        let active = [true, false, true, false];
        let stale = FederatedAggregator::new(InactivePolicy::ContributeStale)
            .aggregate(&params, &MembershipMatrix::ones(4), &active)
            .unwrap();
        let excluded = FederatedAggregator::new(InactivePolicy::Exclude)
            .aggregate(&params, &MembershipMatrix::ones(4), &active)
            .unwrap();

        assert_eq!(stale[1], client_params([4.0, 5.0, 6.0]));
        assert_eq!(excluded[0], client_params([3.0, 4.0, 5.0]));
        // An inactive client still averages with the active ones
        assert_eq!(excluded[1], client_params([3.0, 4.0, 5.0]));
        let diff = excluded[3]
            .max_abs_diff(&client_params([13.0 / 3.0, 16.0 / 3.0, 19.0 / 3.0]))
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_shape_mismatch_names_client_and_peer() {
        let mut params = population();
        params[2] = ModelParams::new()
            .with("fc.weight", Tensor::new(vec![1, 2], vec![0.0, 0.0]).unwrap())
            .with("fc.bias", Tensor::new(vec![1], vec![0.0]).unwrap());
        let err = FederatedAggregator::default()
            .aggregate(&params, &MembershipMatrix::ones(4), &[true; 4])
            .unwrap_err();
        match err {
            FedError::AggregationShape {
                client,
                peer,
                param,
                expected,
                actual,
            } => {
                assert_eq!((client, peer), (0, 2));
                assert_eq!(param, "fc.weight");
                assert_eq!(expected, vec![2]);
                assert_eq!(actual, vec![1, 2]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_mismatched_membership_size() {
        let err = FederatedAggregator::default()
            .aggregate(&population(), &MembershipMatrix::ones(3), &[true; 4])
            .unwrap_err();
        assert!(matches!(err, FedError::Config(_)));
    }
}

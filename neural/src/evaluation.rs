//! Per-round evaluation of client models
//!
//! Each evaluated client is scored on its own train and test index sets; the
//! round summary keeps the mean accuracy and the spread across clients.

use crate::pool::WorkerPool;
use fedclust_core::{
    ClientId, Evaluation, Evaluator, FedError, ModelParams, PartitionMap, Result, Split, SplitPartition, Stage,
};
use serde::{Deserialize, Serialize};

/// When evaluation runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvalCadence {
    #[default]
    EveryRound,
    /// Only after the last round
    RunEnd,
}

/// How per-client accuracies are averaged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Weighting {
    #[default]
    Unweighted,
    /// Weighted by each client's sample count on that split
    BySampleCount,
}

/// Which clients are evaluated
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvalSubset {
    #[default]
    All,
    /// First client of every label group
    Representatives,
    Clients(Vec<ClientId>),
}

impl EvalSubset {
    /// Concrete client ids, ascending and without repeats
    pub fn resolve(&self, partition: &PartitionMap) -> Result<Vec<ClientId>> {
        let n = partition.num_clients();
        let mut ids = match self {
            EvalSubset::All => (0..n).collect(),
            EvalSubset::Representatives => partition.group_representatives(),
            EvalSubset::Clients(ids) => {
                if let Some(bad) = ids.iter().find(|&&c| c >= n) {
                    return Err(FedError::Config(format!(
                        "evaluation client {} out of range for {} clients",
                        bad, n
                    )));
                }
                ids.clone()
            }
        };
        ids.sort_unstable();
        ids.dedup();
        if ids.is_empty() {
            return Err(FedError::Config("evaluation subset is empty".into()));
        }
        Ok(ids)
    }
}

/// Evaluation settings of one run
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    pub cadence: EvalCadence,
    pub weighting: Weighting,
    pub subset: EvalSubset,
}

/// One client's scores on both splits
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClientEvaluation {
    pub client: ClientId,
    pub train: Evaluation,
    pub test: Evaluation,
    pub train_samples: usize,
    pub test_samples: usize,
}

/// Aggregate of one evaluation pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalSummary {
    pub train_accuracy: f64,
    pub test_accuracy: f64,
    /// Population variance of per-client train accuracy
    pub train_variance: f64,
    /// Population variance of per-client test accuracy
    pub test_variance: f64,
    pub clients: Vec<ClientEvaluation>,
}

/// What one round left in the history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round: usize,
    /// Mean local training loss over the active clients
    pub mean_train_loss: f64,
    pub active_clients: Vec<ClientId>,
    pub reclustered: bool,
    pub evaluation: Option<EvalSummary>,
}

/// Score `clients` on both splits, in parallel
pub fn evaluate_clients(
    evaluator: &dyn Evaluator,
    params: &[ModelParams],
    partition: &SplitPartition,
    clients: &[ClientId],
    pool: &WorkerPool,
) -> Result<Vec<ClientEvaluation>> {
    let results = pool.run(clients, |client| {
        let train_idx = partition.train.indices(client);
        let test_idx = partition.test.indices(client);
        let train = evaluator
            .evaluate(&params[client], Split::Train, train_idx)
            .map_err(|e| FedError::collaborator(Stage::Evaluate, client, e))?;
        let test = evaluator
            .evaluate(&params[client], Split::Test, test_idx)
            .map_err(|e| FedError::collaborator(Stage::Evaluate, client, e))?;
        Ok(ClientEvaluation {
            client,
            train,
            test,
            train_samples: train_idx.len(),
            test_samples: test_idx.len(),
        })
    })?;
    Ok(results.into_values().collect())
}

fn mean(values: &[(f64, usize)], weighting: Weighting) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let total: usize = values.iter().map(|(_, w)| w).sum();
    match weighting {
        Weighting::BySampleCount if total > 0 => {
            values.iter().map(|(v, w)| v * *w as f64).sum::<f64>() / total as f64
        }
        _ => values.iter().map(|(v, _)| v).sum::<f64>() / values.len() as f64,
    }
}

fn variance(values: &[(f64, usize)]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values, Weighting::Unweighted);
    values.iter().map(|(v, _)| (v - m) * (v - m)).sum::<f64>() / values.len() as f64
}

/// Fold per-client scores into one summary
pub fn summarize(clients: Vec<ClientEvaluation>, weighting: Weighting) -> EvalSummary {
    let train: Vec<(f64, usize)> = clients.iter().map(|c| (c.train.accuracy, c.train_samples)).collect();
    let test: Vec<(f64, usize)> = clients.iter().map(|c| (c.test.accuracy, c.test_samples)).collect();
    EvalSummary {
        train_accuracy: mean(&train, weighting),
        test_accuracy: mean(&test, weighting),
        train_variance: variance(&train),
        test_variance: variance(&test),
        clients,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedclust_core::partition::partition;
    use fedclust_core::{ClusterSpec, Label, SkewPolicy};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn scored(client: ClientId, train: f64, test: f64, train_samples: usize, test_samples: usize) -> ClientEvaluation {
        ClientEvaluation {
            client,
            train: Evaluation {
                accuracy: train,
                loss: 0.0,
            },
            test: Evaluation {
                accuracy: test,
                loss: 0.0,
            },
            train_samples,
            test_samples,
        }
    }

    #[test]
    fn test_unweighted_summary() {
        let summary = summarize(vec![scored(0, 0.5, 1.0, 10, 1), scored(1, 1.0, 0.0, 30, 3)], Weighting::Unweighted);
        assert_eq!(summary.train_accuracy, 0.75);
        assert_eq!(summary.test_accuracy, 0.5);
        assert_eq!(summary.train_variance, 0.0625);
        assert_eq!(summary.test_variance, 0.25);
    }

    #[test]
    fn test_weighted_summary() {
        let summary = summarize(vec![scored(0, 0.5, 1.0, 10, 1), scored(1, 1.0, 0.0, 30, 3)], Weighting::BySampleCount);
        assert_eq!(summary.train_accuracy, 0.875);
        assert_eq!(summary.test_accuracy, 0.25);
        // Variance stays unweighted
        assert_eq!(summary.train_variance, 0.0625);
    }

    #[test]
    fn test_empty_summary() {
        let summary = summarize(Vec::new(), Weighting::BySampleCount);
        assert_eq!(summary.train_accuracy, 0.0);
        assert_eq!(summary.test_variance, 0.0);
    }

    #[test]
    fn test_subset_resolution() {
        let labels: Vec<Label> = (0..40).map(|i| (i % 4) as Label).collect();
        let spec = ClusterSpec::new(vec![vec![0, 1], vec![2, 3]]).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let map = partition(&labels, 6, &spec, &SkewPolicy::Iid, &mut rng).unwrap();

        assert_eq!(EvalSubset::All.resolve(&map).unwrap(), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(EvalSubset::Representatives.resolve(&map).unwrap(), vec![0, 3]);
        assert_eq!(EvalSubset::Clients(vec![4, 1, 4]).resolve(&map).unwrap(), vec![1, 4]);
        assert!(EvalSubset::Clients(vec![6]).resolve(&map).is_err());
        assert!(EvalSubset::Clients(Vec::new()).resolve(&map).is_err());
    }
}

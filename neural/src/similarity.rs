// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pairwise client similarity estimators
//!
//! Three sources feed the same report shape: the clients' own label
//! histograms, the geometry of their embedded data, and their trained
//! parameters.

use crate::kmeans::{squared_distance, KMeans, KMeansInit};
use crate::pool::WorkerPool;
use fedclust_core::{
    derive_seed, AffinityKind, AffinityMatrix, ClientId, EmbeddingCollaborator, FedError, Label, ModelParams,
    PartitionMap, Result, Stage,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Everything an estimator may look at during one clustering event
pub struct EstimationInput<'a> {
    /// Training partition currently in force
    pub partition: &'a PartitionMap,
    /// Labels of the training split
    pub labels: &'a [Label],
    /// Current per-client parameters
    pub params: &'a [ModelParams],
    pub pool: &'a WorkerPool,
}

/// Output of one estimation
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityReport {
    pub affinity: AffinityMatrix,
    /// Cluster label per client, when the estimator clusters directly
    pub labels: Option<Vec<usize>>,
    /// Per-client centroid pairs from the embedding estimator
    pub centroids: Option<Vec<[Vec<f64>; 2]>>,
    /// Cutoff the estimator was configured with, if any
    pub suggested_cutoff: Option<f64>,
}

impl SimilarityReport {
    fn from_affinity(affinity: AffinityMatrix) -> Self {
        Self {
            affinity,
            labels: None,
            centroids: None,
            suggested_cutoff: None,
        }
    }
}

/// Turns the current round state into pairwise affinities
pub trait SimilarityEstimator: Send {
    fn name(&self) -> &'static str;

    fn estimate(&mut self, input: &EstimationInput<'_>) -> Result<SimilarityReport>;
}

/// Oracle estimator: clients match when their two dominant labels agree
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelOverlap;

/// The two most frequent labels among `indices`, smaller label first on ties
pub fn top_two_labels(labels: &[Label], indices: &[usize]) -> Vec<Label> {
    let mut counts: BTreeMap<Label, usize> = BTreeMap::new();
    for &idx in indices {
        *counts.entry(labels[idx]).or_default() += 1;
    }
    let mut ranked: Vec<(Label, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let mut top: Vec<Label> = ranked.into_iter().take(2).map(|(label, _)| label).collect();
    top.sort_unstable();
    top
}

impl SimilarityEstimator for LabelOverlap {
    fn name(&self) -> &'static str {
        "label-overlap"
    }

    fn estimate(&mut self, input: &EstimationInput<'_>) -> Result<SimilarityReport> {
        let n = input.partition.num_clients();
        let tops: Vec<Vec<Label>> = (0..n)
            .map(|c| top_two_labels(input.labels, input.partition.indices(c)))
            .collect();
        let affinity = AffinityMatrix::from_fn(n, AffinityKind::Similarity, |i, j| {
            if tops[i] == tops[j] {
                1.0
            } else {
                0.0
            }
        });
        Ok(SimilarityReport::from_affinity(affinity))
    }
}

/// How the manifold reducer is fit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReducerMode {
    /// A fresh reduction per client
    #[default]
    FitPerClient,
    /// One reduction over all clients' embeddings, split back per client
    Shared,
}

/// Embedding estimator: distance between each client's two 2-means centroids
pub struct EmbeddingCentroid {
    embedder: Arc<dyn EmbeddingCollaborator>,
    threshold: f64,
    target_dim: usize,
    mode: ReducerMode,
    seed: u64,
}

impl EmbeddingCentroid {
    pub fn new(
        embedder: Arc<dyn EmbeddingCollaborator>,
        threshold: f64,
        target_dim: usize,
        mode: ReducerMode,
        seed: u64,
    ) -> Self {
        Self {
            embedder,
            threshold,
            target_dim,
            mode,
            seed,
        }
    }

    fn embed_all(&self, input: &EstimationInput<'_>) -> Result<BTreeMap<ClientId, Vec<Vec<f64>>>> {
        let clients: Vec<ClientId> = (0..input.partition.num_clients()).collect();
        let embedded = input.pool.run(&clients, |client| {
            let indices = input.partition.indices(client);
            let out = self
                .embedder
                .embed(client, indices)
                .map_err(|e| FedError::collaborator(Stage::Embed, client, e))?;
            check_label_order(client, indices, input.labels, &out.labels, out.vectors.len())?;
            Ok(out.vectors)
        })?;

        match self.mode {
            ReducerMode::FitPerClient => input.pool.run(&clients, |client| {
                let reduced = self
                    .embedder
                    .reduce(&embedded[&client], self.target_dim)
                    .map_err(|e| FedError::collaborator(Stage::Reduce, client, e))?;
                self.check_reduced(client, embedded[&client].len(), &reduced)?;
                Ok(reduced)
            }),
            ReducerMode::Shared => {
                let pooled: Vec<Vec<f64>> = embedded.values().flatten().cloned().collect();
                // Shared reduction failures are charged to the lowest client id
                let blame = clients.first().copied().unwrap_or_default();
                let reduced = self
                    .embedder
                    .reduce(&pooled, self.target_dim)
                    .map_err(|e| FedError::collaborator(Stage::Reduce, blame, e))?;
                self.check_reduced(blame, pooled.len(), &reduced)?;

                let mut rest = reduced.into_iter();
                Ok(embedded
                    .iter()
                    .map(|(&client, vectors)| (client, rest.by_ref().take(vectors.len()).collect()))
                    .collect())
            }
        }
    }

    fn check_reduced(&self, client: ClientId, expected_len: usize, reduced: &[Vec<f64>]) -> Result<()> {
        if reduced.len() != expected_len || reduced.iter().any(|v| v.len() != self.target_dim) {
            return Err(FedError::collaborator(
                Stage::Reduce,
                client,
                anyhow::anyhow!(
                    "reducer returned {} vectors for {} inputs, expected dimension {}",
                    reduced.len(),
                    expected_len,
                    self.target_dim
                ),
            ));
        }
        Ok(())
    }
}

/// Labels recorded by the embedder must follow the client's index order
fn check_label_order(
    client: ClientId,
    indices: &[usize],
    dataset_labels: &[Label],
    recorded: &[Label],
    num_vectors: usize,
) -> Result<()> {
    let len = indices.len().max(recorded.len()).max(num_vectors);
    for position in 0..len {
        let expected = indices.get(position).map(|&idx| dataset_labels[idx]);
        let actual = recorded.get(position).copied();
        if expected != actual || position >= num_vectors {
            return Err(FedError::Ordering {
                client,
                position,
                expected,
                actual,
            });
        }
    }
    Ok(())
}

/// Distance between two centroid pairs under the better of the two pairings
pub fn centroid_distance(a: &[Vec<f64>; 2], b: &[Vec<f64>; 2]) -> f64 {
    let straight = squared_distance(&a[0], &b[0]) + squared_distance(&a[1], &b[1]);
    let crossed = squared_distance(&a[0], &b[1]) + squared_distance(&a[1], &b[0]);
    straight.min(crossed)
}

impl SimilarityEstimator for EmbeddingCentroid {
    fn name(&self) -> &'static str {
        "embedding-centroid"
    }

    fn estimate(&mut self, input: &EstimationInput<'_>) -> Result<SimilarityReport> {
        let reduced = self.embed_all(input)?;

        // Barrier passed: every client is embedded before any k-means runs
        let mut centroids = Vec::with_capacity(reduced.len());
        for (&client, points) in &reduced {
            let fit = KMeans::new(2)
                .with_seed(derive_seed(self.seed, 0x656d, client as u64))
                .fit(points, &KMeansInit::PlusPlus { n_init: 10 })?;
            let mut centers = fit.centers.into_iter();
            let first = centers.next().unwrap_or_default();
            let second = centers.next().unwrap_or_default();
            centroids.push([first, second]);
        }

        let n = centroids.len();
        let affinity = AffinityMatrix::from_fn(n, AffinityKind::Distance, |i, j| {
            centroid_distance(&centroids[i], &centroids[j])
        });
        tracing::debug!(clients = n, threshold = self.threshold, "Embedding centroids computed");

        Ok(SimilarityReport {
            affinity,
            labels: None,
            centroids: Some(centroids),
            suggested_cutoff: Some(self.threshold),
        })
    }
}

/// Parameter-space k-means over the flattened client models
#[derive(Debug, Clone)]
pub struct ParameterDistance {
    num_clusters: usize,
    n_init: usize,
    seed: u64,
    centers: Option<Vec<Vec<f64>>>,
}

impl ParameterDistance {
    pub fn new(num_clusters: usize, n_init: usize, seed: u64) -> Self {
        Self {
            num_clusters,
            n_init,
            seed,
            centers: None,
        }
    }

    /// Centers kept from the previous clustering event
    pub fn centers(&self) -> Option<&[Vec<f64>]> {
        self.centers.as_deref()
    }
}

impl SimilarityEstimator for ParameterDistance {
    fn name(&self) -> &'static str {
        "parameter-distance"
    }

    fn estimate(&mut self, input: &EstimationInput<'_>) -> Result<SimilarityReport> {
        let points: Vec<Vec<f64>> = input.params.iter().map(ModelParams::flatten).collect();
        let init = match self.centers.take() {
            Some(previous) => KMeansInit::Centers(previous),
            None => KMeansInit::PlusPlus { n_init: self.n_init },
        };
        let warm = matches!(init, KMeansInit::Centers(_));
        let fit = KMeans::new(self.num_clusters).with_seed(self.seed).fit(&points, &init)?;
        tracing::debug!(
            clusters = self.num_clusters,
            warm_start = warm,
            inertia = fit.inertia,
            iterations = fit.iterations,
            "Parameter k-means converged"
        );

        let labels = fit.labels;
        let affinity = AffinityMatrix::from_fn(points.len(), AffinityKind::Similarity, |i, j| {
            if labels[i] == labels[j] {
                1.0
            } else {
                0.0
            }
        });
        self.centers = Some(fit.centers);

        Ok(SimilarityReport {
            affinity,
            labels: Some(labels),
            centroids: None,
            suggested_cutoff: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedclust_core::partition::partition;
    use fedclust_core::{ClusterSpec, Embedded, SkewPolicy, Tensor};
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Two groups of clients: labels {0,1} and {2,3}
    fn grouped_partition() -> (Vec<Label>, PartitionMap) {
        let labels: Vec<Label> = (0..80).map(|i| (i % 4) as Label).collect();
        let spec = ClusterSpec::new(vec![vec![0, 1], vec![2, 3]]).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let map = partition(&labels, 4, &spec, &SkewPolicy::LabelCluster { samples_per_label: 5 }, &mut rng).unwrap();
        (labels, map)
    }

    /// Embeds each sample at a point determined by its label
    struct LabelEmbedder {
        labels: Vec<Label>,
        scramble_client: Option<ClientId>,
    }

    impl EmbeddingCollaborator for LabelEmbedder {
        fn embed(&self, client: ClientId, indices: &[usize]) -> anyhow::Result<Embedded> {
            let mut labels: Vec<Label> = indices.iter().map(|&i| self.labels[i]).collect();
            if self.scramble_client == Some(client) {
                labels.reverse();
            }
            let vectors = indices
                .iter()
                .enumerate()
                .map(|(k, &i)| vec![self.labels[i] as f64 * 10.0, (k % 3) as f64 * 0.01])
                .collect();
            Ok(Embedded { vectors, labels })
        }

        fn reduce(&self, vectors: &[Vec<f64>], target_dim: usize) -> anyhow::Result<Vec<Vec<f64>>> {
            Ok(vectors.iter().map(|v| v[..target_dim].to_vec()).collect())
        }
    }

    #[test]
    fn test_top_two_tie_break() {
        let labels = vec![5, 5, 3, 3, 1, 1, 7];
        assert_eq!(top_two_labels(&labels, &[0, 1, 2, 3, 4, 5, 6]), vec![1, 3]);
        assert_eq!(top_two_labels(&labels, &[0, 1, 6]), vec![5, 7]);
    }

    #[test]
    fn test_label_overlap_oracle() {
        let (labels, map) = grouped_partition();
        let pool = WorkerPool::new(1);
        let input = EstimationInput {
            partition: &map,
            labels: &labels,
            params: &[],
            pool: &pool,
        };
        let report = LabelOverlap.estimate(&input).unwrap();
        assert_eq!(report.affinity.kind(), AffinityKind::Similarity);
        assert!(report.affinity.is_symmetric(0.0));
        for i in 0..4 {
            for j in 0..4 {
                let same = map.group_of(i) == map.group_of(j);
                assert_eq!(report.affinity.get(i, j), if same { 1.0 } else { 0.0 });
            }
        }
    }

    #[test]
    fn test_embedding_centroid_separates_groups() {
        let (labels, map) = grouped_partition();
        let embedder = Arc::new(LabelEmbedder {
            labels: labels.clone(),
            scramble_client: None,
        });
        for mode in [ReducerMode::FitPerClient, ReducerMode::Shared] {
            let mut estimator = EmbeddingCentroid::new(embedder.clone(), 1.0, 2, mode, 3);
            let pool = WorkerPool::new(2);
            let input = EstimationInput {
                partition: &map,
                labels: &labels,
                params: &[],
                pool: &pool,
            };
            let report = estimator.estimate(&input).unwrap();
            assert_eq!(report.affinity.kind(), AffinityKind::Distance);
            assert_eq!(report.suggested_cutoff, Some(1.0));
            for i in 0..4 {
                for j in 0..4 {
                    let d = report.affinity.get(i, j);
                    if map.group_of(i) == map.group_of(j) {
                        assert!(d < 1.0, "{i},{j} -> {d}");
                    } else {
                        assert!(d > 100.0, "{i},{j} -> {d}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_ordering_guard() {
        let (labels, map) = grouped_partition();
        let embedder = Arc::new(LabelEmbedder {
            labels: labels.clone(),
            scramble_client: Some(2),
        });
        let mut estimator = EmbeddingCentroid::new(embedder, 1.0, 2, ReducerMode::FitPerClient, 0);
        let pool = WorkerPool::new(3);
        let input = EstimationInput {
            partition: &map,
            labels: &labels,
            params: &[],
            pool: &pool,
        };
        match estimator.estimate(&input).unwrap_err() {
            FedError::Ordering { client, position, .. } => {
                assert_eq!(client, 2);
                assert_eq!(position, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    fn params_at(x: f32) -> ModelParams {
        ModelParams::new().with("w", Tensor::new(vec![2], vec![x, -x]).unwrap())
    }

    #[test]
    fn test_parameter_distance_warm_starts() {
        let (labels, map) = grouped_partition();
        let params = vec![params_at(0.0), params_at(0.1), params_at(5.0), params_at(5.1)];
        let pool = WorkerPool::new(1);
        let input = EstimationInput {
            partition: &map,
            labels: &labels,
            params: &params,
            pool: &pool,
        };
        let mut estimator = ParameterDistance::new(2, 5, 9);
        assert!(estimator.centers().is_none());

        let first = estimator.estimate(&input).unwrap();
        let report_labels = first.labels.clone().unwrap();
        assert_eq!(report_labels[0], report_labels[1]);
        assert_eq!(report_labels[2], report_labels[3]);
        assert_ne!(report_labels[0], report_labels[2]);
        assert_eq!(first.affinity.get(0, 1), 1.0);
        assert_eq!(first.affinity.get(0, 2), 0.0);

        // Warm start keeps cluster ids stable
        let second = estimator.estimate(&input).unwrap();
        assert_eq!(second.labels, Some(report_labels));
        assert_eq!(estimator.centers().map(<[_]>::len), Some(2));
    }

    proptest! {
        #[test]
        fn prop_centroid_distance_swap_invariant(
            a in proptest::collection::vec(-50.0f64..50.0, 4),
            b in proptest::collection::vec(-50.0f64..50.0, 4),
        ) {
            let pa = [a[0..2].to_vec(), a[2..4].to_vec()];
            let pa_swapped = [a[2..4].to_vec(), a[0..2].to_vec()];
            let pb = [b[0..2].to_vec(), b[2..4].to_vec()];
            let pb_swapped = [b[2..4].to_vec(), b[0..2].to_vec()];

            let d = centroid_distance(&pa, &pb);
            prop_assert_eq!(d, centroid_distance(&pa_swapped, &pb));
            prop_assert_eq!(d, centroid_distance(&pa, &pb_swapped));
            prop_assert!(d >= 0.0);
        }
    }
}

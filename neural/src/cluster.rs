//! Cluster assignment policies and re-clustering cadence

use crate::kmeans::{KMeans, KMeansInit};
use crate::similarity::SimilarityReport;
use fedclust_core::{AffinityKind, FedError, MembershipMatrix, Result};
use serde::{Deserialize, Serialize};

/// Turns a similarity report into a binary membership matrix
///
/// Every implementation keeps `M[i][i] == 1`.
pub trait ClusterAssigner: Send + Sync {
    fn name(&self) -> &'static str;

    /// Membership in force before the first clustering event
    fn initial_membership(&self, n: usize) -> MembershipMatrix {
        MembershipMatrix::ones(n)
    }

    /// Whether `assign` needs a similarity report at all
    fn uses_similarity(&self) -> bool {
        true
    }

    fn assign(&self, n: usize, report: Option<&SimilarityReport>) -> Result<MembershipMatrix>;
}

fn require_report<'a>(
    assigner: &'static str,
    n: usize,
    report: Option<&'a SimilarityReport>,
) -> Result<&'a SimilarityReport> {
    let report = report.ok_or_else(|| FedError::Config(format!("{} assignment needs a similarity report", assigner)))?;
    if report.affinity.n() != n {
        return Err(FedError::Config(format!(
            "{} assignment over {} clients given a {}x{} affinity",
            assigner,
            n,
            report.affinity.n(),
            report.affinity.n()
        )));
    }
    Ok(report)
}

/// Everyone aggregates with everyone (global FedAvg)
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleCluster;

impl ClusterAssigner for SingleCluster {
    fn name(&self) -> &'static str {
        "single"
    }

    fn uses_similarity(&self) -> bool {
        false
    }

    fn assign(&self, n: usize, _report: Option<&SimilarityReport>) -> Result<MembershipMatrix> {
        Ok(MembershipMatrix::ones(n))
    }
}

/// No sharing: each client keeps its own model
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalOnly;

impl ClusterAssigner for LocalOnly {
    fn name(&self) -> &'static str {
        "local"
    }

    fn initial_membership(&self, n: usize) -> MembershipMatrix {
        MembershipMatrix::identity(n)
    }

    fn uses_similarity(&self) -> bool {
        false
    }

    fn assign(&self, n: usize, _report: Option<&SimilarityReport>) -> Result<MembershipMatrix> {
        Ok(MembershipMatrix::identity(n))
    }
}

/// Binarize the affinity at a cutoff
///
/// Distances join below the cutoff, similarities at or above it. Without an
/// explicit cutoff the estimator's suggestion is used.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThresholdAssigner {
    cutoff: Option<f64>,
}

impl ThresholdAssigner {
    pub fn new(cutoff: Option<f64>) -> Self {
        Self { cutoff }
    }
}

impl ClusterAssigner for ThresholdAssigner {
    fn name(&self) -> &'static str {
        "threshold"
    }

    fn assign(&self, n: usize, report: Option<&SimilarityReport>) -> Result<MembershipMatrix> {
        let report = require_report(self.name(), n, report)?;
        let cutoff = self
            .cutoff
            .or(report.suggested_cutoff)
            .ok_or_else(|| FedError::Config("threshold assignment needs a cutoff".into()))?;
        let affinity = &report.affinity;
        Ok(MembershipMatrix::from_fn(n, |i, j| match affinity.kind() {
            AffinityKind::Distance => affinity.get(i, j) < cutoff,
            AffinityKind::Similarity => affinity.get(i, j) >= cutoff,
        }))
    }
}

/// Clients sharing a k-means label form one cluster
#[derive(Debug, Clone, Copy)]
pub struct KMeansLabelAssigner {
    k: usize,
    seed: u64,
}

impl KMeansLabelAssigner {
    pub fn new(k: usize, seed: u64) -> Self {
        Self { k, seed }
    }
}

impl ClusterAssigner for KMeansLabelAssigner {
    fn name(&self) -> &'static str {
        "kmeans-label"
    }

    fn assign(&self, n: usize, report: Option<&SimilarityReport>) -> Result<MembershipMatrix> {
        let report = require_report(self.name(), n, report)?;
        let labels = match &report.labels {
            Some(labels) if labels.len() == n => labels.clone(),
            Some(labels) => {
                return Err(FedError::Config(format!(
                    "report carries {} cluster labels for {} clients",
                    labels.len(),
                    n
                )))
            }
            None => {
                let rows: Vec<Vec<f64>> = (0..n).map(|i| report.affinity.row(i).to_vec()).collect();
                KMeans::new(self.k)
                    .with_seed(self.seed)
                    .fit(&rows, &KMeansInit::PlusPlus { n_init: 10 })?
                    .labels
            }
        };
        Ok(MembershipMatrix::from_labels(&labels))
    }
}

/// When clustering events happen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "every", rename_all = "kebab-case")]
pub enum ReclusterSchedule {
    /// Every round
    #[default]
    Round,
    /// Rounds 0, K, 2K, ...
    Rounds { interval: usize },
    /// Exactly once, right after the dataset switch
    OnceAfterSwitch,
    /// Only the initial assignment
    Never,
}

impl ReclusterSchedule {
    /// Whether `round` reclusters; `switch_pending` is set on the first round
    /// after a dataset switch
    pub fn due(&self, round: usize, switch_pending: bool) -> bool {
        if switch_pending {
            return !matches!(self, ReclusterSchedule::Never);
        }
        match self {
            ReclusterSchedule::Round => true,
            ReclusterSchedule::Rounds { interval } => *interval > 0 && round % interval == 0,
            ReclusterSchedule::OnceAfterSwitch | ReclusterSchedule::Never => false,
        }
    }
}

/// Build the assigner for a clustering method name
pub fn assigner_for(method: &crate::config::ClusteringMethod, seed: u64) -> Box<dyn ClusterAssigner> {
    use crate::config::ClusteringMethod;
    match method {
        ClusteringMethod::Single => Box::new(SingleCluster),
        ClusteringMethod::Local => Box::new(LocalOnly),
        ClusteringMethod::Threshold { cutoff } => Box::new(ThresholdAssigner::new(*cutoff)),
        ClusteringMethod::KmeansLabel { num_clusters } => Box::new(KMeansLabelAssigner::new(*num_clusters, seed)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedclust_core::AffinityMatrix;

    fn report(affinity: AffinityMatrix) -> SimilarityReport {
        SimilarityReport {
            affinity,
            labels: None,
            centroids: None,
            suggested_cutoff: None,
        }
    }

    fn assert_diagonal(m: &MembershipMatrix) {
        for i in 0..m.n() {
            assert!(m.get(i, i));
        }
    }

    #[test]
    fn test_single_and_local() {
        let single = SingleCluster.assign(3, None).unwrap();
        assert_eq!(single.distinct_rows(), 1);
        assert!(single.get(0, 2));

        let local = LocalOnly.assign(3, None).unwrap();
        assert_eq!(local.members(1), vec![1]);
        assert_eq!(LocalOnly.initial_membership(3), local);
        assert_eq!(SingleCluster.initial_membership(3), single);
    }

    #[test]
    fn test_threshold_distance_is_strict() {
        let distances = [[0.0, 0.5, 1.0], [0.5, 0.0, 3.0], [1.0, 3.0, 0.0]];
        let affinity = AffinityMatrix::from_fn(3, AffinityKind::Distance, |i, j| distances[i][j]);
        let m = ThresholdAssigner::new(Some(1.0)).assign(3, Some(&report(affinity))).unwrap();
        assert!(m.get(0, 1));
        assert!(!m.get(0, 2));
        assert!(!m.get(1, 2));
        assert_diagonal(&m);
    }

    #[test]
    fn test_threshold_similarity_is_inclusive() {
        let affinity = AffinityMatrix::from_fn(2, AffinityKind::Similarity, |_, _| 0.5);
        let m = ThresholdAssigner::new(Some(0.5)).assign(2, Some(&report(affinity))).unwrap();
        assert!(m.get(0, 1));
    }

    #[test]
    fn test_threshold_uses_suggested_cutoff() {
        // Asymmetric distances keep their asymmetry in the membership
        let affinity = AffinityMatrix::from_fn(2, AffinityKind::Distance, |i, j| if i < j { 0.2 } else { 5.0 });
        let mut r = report(affinity);
        assert!(ThresholdAssigner::new(None).assign(2, Some(&r)).is_err());
        r.suggested_cutoff = Some(1.0);
        let m = ThresholdAssigner::new(None).assign(2, Some(&r)).unwrap();
        assert!(m.get(0, 1));
        assert!(!m.get(1, 0));
        assert_diagonal(&m);
    }

    #[test]
    fn test_kmeans_label_from_report_labels() {
        let mut r = report(AffinityMatrix::new(4, AffinityKind::Similarity));
        r.labels = Some(vec![1, 0, 1, 0]);
        let m = KMeansLabelAssigner::new(2, 0).assign(4, Some(&r)).unwrap();
        assert_eq!(m.members(0), vec![0, 2]);
        assert_eq!(m.members(3), vec![1, 3]);
    }

    #[test]
    fn test_kmeans_label_over_affinity_rows() {
        let blocks = [0, 0, 1, 1];
        let affinity = AffinityMatrix::from_fn(4, AffinityKind::Similarity, |i, j| {
            if blocks[i] == blocks[j] {
                1.0
            } else {
                0.0
            }
        });
        let m = KMeansLabelAssigner::new(2, 7).assign(4, Some(&report(affinity))).unwrap();
        assert_eq!(m.members(0), vec![0, 1]);
        assert_eq!(m.members(2), vec![2, 3]);
    }

    #[test]
    fn test_missing_report_is_config_error() {
        assert!(matches!(ThresholdAssigner::new(Some(1.0)).assign(2, None), Err(FedError::Config(_))));
        let wrong = report(AffinityMatrix::new(3, AffinityKind::Distance));
        assert!(KMeansLabelAssigner::new(2, 0).assign(2, Some(&wrong)).is_err());
    }

    #[test]
    fn test_schedule() {
        assert!(ReclusterSchedule::Round.due(3, false));
        let every_three = ReclusterSchedule::Rounds { interval: 3 };
        assert!(every_three.due(0, false));
        assert!(!every_three.due(1, false));
        assert!(every_three.due(6, false));
        assert!(every_three.due(7, true));
        assert!(!ReclusterSchedule::OnceAfterSwitch.due(0, false));
        assert!(ReclusterSchedule::OnceAfterSwitch.due(5, true));
        assert!(!ReclusterSchedule::Never.due(5, true));
    }
}

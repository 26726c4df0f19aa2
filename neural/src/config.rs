//! Run configuration
//!
//! One [`RunConfig`] describes one isolated simulation. Configs load from TOML
//! or JSON and are validated before any partitioning or training happens.

use crate::cluster::ReclusterSchedule;
use crate::evaluation::EvaluationConfig;
use crate::federated::InactivePolicy;
use crate::similarity::ReducerMode;
use fedclust_core::{FedError, Result, SkewPolicy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// How membership is derived from similarity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub enum ClusteringMethod {
    /// One global cluster (plain FedAvg)
    Single,
    /// Every client alone
    Local,
    /// Binarize the affinity; falls back to the estimator's threshold
    Threshold {
        #[serde(default)]
        cutoff: Option<f64>,
    },
    /// Same k-means label, same cluster
    KmeansLabel { num_clusters: usize },
}

impl ClusteringMethod {
    pub fn name(&self) -> &'static str {
        match self {
            ClusteringMethod::Single => "single",
            ClusteringMethod::Local => "local",
            ClusteringMethod::Threshold { .. } => "threshold",
            ClusteringMethod::KmeansLabel { .. } => "kmeans-label",
        }
    }

    /// Whether the method consumes an estimator report
    pub fn needs_estimator(&self) -> bool {
        matches!(self, ClusteringMethod::Threshold { .. } | ClusteringMethod::KmeansLabel { .. })
    }
}

fn default_target_dim() -> usize {
    2
}

fn default_n_init() -> usize {
    20
}

/// Which similarity estimator feeds the assigner
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum EstimatorConfig {
    /// Oracle on the clients' dominant labels
    LabelOverlap,
    /// 2-means centroids of the reduced embeddings
    EmbeddingCentroid {
        /// Membership cutoff on centroid distance; required
        #[serde(default)]
        threshold: Option<f64>,
        #[serde(default = "default_target_dim")]
        target_dim: usize,
        #[serde(default)]
        reducer: ReducerMode,
    },
    /// k-means over flattened parameters
    ParameterDistance {
        num_clusters: usize,
        #[serde(default = "default_n_init")]
        n_init: usize,
    },
}

impl EstimatorConfig {
    pub fn name(&self) -> &'static str {
        match self {
            EstimatorConfig::LabelOverlap => "label-overlap",
            EstimatorConfig::EmbeddingCentroid { .. } => "embedding-centroid",
            EstimatorConfig::ParameterDistance { .. } => "parameter-distance",
        }
    }
}

/// Shape of the label groups behind the cluster spec
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub num_groups: usize,
    /// Labels per group; `None` splits all labels into contiguous ranges
    #[serde(default)]
    pub labels_per_group: Option<usize>,
    /// Fraction of labels shared by consecutive groups, in `[0, 1)`
    #[serde(default)]
    pub overlap: f64,
}

/// Regenerate groups and data partition mid-run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DatasetSwitch {
    /// First round trained on the new partition
    pub round: usize,
    #[serde(default)]
    pub overlap: f64,
}

fn default_true() -> bool {
    true
}

/// Optional artifacts beyond the CSV summaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactConfig {
    /// PGM snapshot on every clustering event
    #[serde(default = "default_true")]
    pub membership_snapshots: bool,
    /// Compressed checkpoint of the final round state
    #[serde(default)]
    pub checkpoint: bool,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            membership_snapshots: true,
            checkpoint: false,
        }
    }
}

fn default_fraction() -> f64 {
    1.0
}

/// One simulation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Prefix of every artifact file
    pub name: String,
    pub seed: u64,
    pub num_clients: usize,
    /// Fraction of clients sampled per round
    #[serde(default = "default_fraction")]
    pub participation_fraction: f64,
    /// Train every client every round regardless of the fraction
    #[serde(default)]
    pub full_participation: bool,
    pub rounds: usize,
    pub clustering: ClusteringMethod,
    #[serde(default)]
    pub estimator: Option<EstimatorConfig>,
    #[serde(default)]
    pub recluster: ReclusterSchedule,
    pub skew: SkewPolicy,
    pub groups: GroupConfig,
    #[serde(default)]
    pub dataset_switch: Option<DatasetSwitch>,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub inactive: InactivePolicy,
    /// Worker pool size; defaults to available parallelism
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub artifacts: ArtifactConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::fedavg()
    }
}

impl RunConfig {
    /// Global FedAvg over label-clustered clients
    pub fn fedavg() -> Self {
        Self {
            name: "fedavg".to_string(),
            seed: 42,
            num_clients: 20,
            participation_fraction: 1.0,
            full_participation: false,
            rounds: 10,
            clustering: ClusteringMethod::Single,
            estimator: None,
            recluster: ReclusterSchedule::Never,
            skew: SkewPolicy::LabelCluster { samples_per_label: 50 },
            groups: GroupConfig {
                num_groups: 5,
                labels_per_group: Some(2),
                overlap: 0.0,
            },
            dataset_switch: None,
            evaluation: EvaluationConfig::default(),
            inactive: InactivePolicy::ContributeStale,
            workers: None,
            artifacts: ArtifactConfig::default(),
        }
    }

    /// No aggregation at all
    pub fn local_only() -> Self {
        Self {
            name: "local".to_string(),
            clustering: ClusteringMethod::Local,
            ..Self::fedavg()
        }
    }

    /// Clusters from the clients' true dominant labels
    pub fn oracle_clusters() -> Self {
        Self {
            name: "oracle".to_string(),
            clustering: ClusteringMethod::Threshold { cutoff: Some(1.0) },
            estimator: Some(EstimatorConfig::LabelOverlap),
            recluster: ReclusterSchedule::Round,
            ..Self::fedavg()
        }
    }

    /// k-means over model parameters, warm-started every round
    pub fn parameter_clusters() -> Self {
        Self {
            name: "multi-center".to_string(),
            clustering: ClusteringMethod::KmeansLabel { num_clusters: 5 },
            estimator: Some(EstimatorConfig::ParameterDistance {
                num_clusters: 5,
                n_init: default_n_init(),
            }),
            recluster: ReclusterSchedule::Round,
            ..Self::fedavg()
        }
    }

    /// Clients sampled per round: `max(floor(fraction * N), 1)`
    pub fn clients_per_round(&self) -> usize {
        if self.full_participation {
            return self.num_clients;
        }
        ((self.participation_fraction * self.num_clients as f64).floor() as usize).clamp(1, self.num_clients.max(1))
    }

    /// Reject inconsistent settings before any side effect
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: String| Err(FedError::Config(format!("{}: {}", self.name, reason)));

        if self.name.trim().is_empty() {
            return Err(FedError::Config("config name must not be empty".into()));
        }
        if self.num_clients == 0 {
            return fail("number of clients must be positive".into());
        }
        if self.rounds == 0 {
            return fail("at least one round is required".into());
        }
        let frac = self.participation_fraction;
        if frac.is_nan() || frac <= 0.0 || frac > 1.0 {
            return fail(format!(
                "participation fraction {} not in (0, 1]",
                self.participation_fraction
            ));
        }
        if self.workers == Some(0) {
            return fail("worker count must be positive".into());
        }

        let groups = &self.groups;
        if groups.num_groups == 0 || groups.num_groups > self.num_clients {
            return fail(format!(
                "{} label groups for {} clients",
                groups.num_groups, self.num_clients
            ));
        }
        if groups.labels_per_group == Some(0) {
            return fail("labels per group must be positive".into());
        }
        if !(0.0..1.0).contains(&groups.overlap) {
            return fail(format!("group overlap {} not in [0, 1)", groups.overlap));
        }

        match self.skew {
            SkewPolicy::Iid => {}
            SkewPolicy::Shard { num_shards } => {
                if num_shards < 2 * self.num_clients {
                    return fail(format!(
                        "{} shards cannot give {} clients two shards each",
                        num_shards, self.num_clients
                    ));
                }
            }
            SkewPolicy::PowerLaw { curvature, .. } => {
                if !curvature.is_finite() || curvature <= 0.0 {
                    return fail(format!("power-law curvature {} must be positive", curvature));
                }
            }
            SkewPolicy::LabelCluster { samples_per_label } => {
                if samples_per_label == 0 {
                    return fail("samples per label must be positive".into());
                }
            }
        }

        match self.clustering {
            ClusteringMethod::Threshold { cutoff: Some(c) } if !c.is_finite() => {
                return fail(format!("threshold cutoff {} is not finite", c));
            }
            ClusteringMethod::KmeansLabel { num_clusters } if num_clusters == 0 || num_clusters > self.num_clients => {
                return fail(format!(
                    "{} k-means clusters for {} clients",
                    num_clusters, self.num_clients
                ));
            }
            _ => {}
        }

        match (self.clustering.needs_estimator(), self.estimator) {
            (true, None) => {
                return fail(format!("{} clustering needs an estimator", self.clustering.name()));
            }
            (_, Some(EstimatorConfig::EmbeddingCentroid {
                threshold, target_dim, ..
            })) => {
                match threshold {
                    None => return fail("embedding-centroid estimator needs an explicit threshold".into()),
                    Some(t) if !t.is_finite() || t <= 0.0 => {
                        return fail(format!("embedding threshold {} must be positive", t));
                    }
                    _ => {}
                }
                if target_dim == 0 {
                    return fail("reduction target dimension must be positive".into());
                }
            }
            (_, Some(EstimatorConfig::ParameterDistance { num_clusters, n_init })) => {
                if num_clusters == 0 || num_clusters > self.num_clients {
                    return fail(format!(
                        "{} parameter clusters for {} clients",
                        num_clusters, self.num_clients
                    ));
                }
                if n_init == 0 {
                    return fail("k-means needs at least one restart".into());
                }
            }
            _ => {}
        }

        match (self.clustering, self.estimator) {
            (ClusteringMethod::Threshold { cutoff: None }, Some(estimator))
                if !matches!(estimator, EstimatorConfig::EmbeddingCentroid { .. }) =>
            {
                return fail(format!(
                    "threshold clustering without a cutoff needs the embedding-centroid estimator, {} supplies none",
                    estimator.name()
                ));
            }
            (
                ClusteringMethod::KmeansLabel { num_clusters },
                Some(EstimatorConfig::ParameterDistance {
                    num_clusters: estimated, ..
                }),
            ) if num_clusters != estimated => {
                return fail(format!(
                    "k-means label clustering wants {} clusters, parameter-distance estimator produces {}",
                    num_clusters, estimated
                ));
            }
            _ => {}
        }

        if let ReclusterSchedule::Rounds { interval: 0 } = self.recluster {
            return fail("recluster interval must be positive".into());
        }
        if self.recluster == ReclusterSchedule::OnceAfterSwitch && self.dataset_switch.is_none() {
            return fail("once-after-switch reclustering needs a dataset switch".into());
        }
        if let Some(switch) = &self.dataset_switch {
            if switch.round == 0 || switch.round >= self.rounds {
                return fail(format!(
                    "dataset switch at round {} must fall inside 1..{}",
                    switch.round, self.rounds
                ));
            }
            if !(0.0..1.0).contains(&switch.overlap) {
                return fail(format!("switch overlap {} not in [0, 1)", switch.overlap));
            }
        }
        if let crate::evaluation::EvalSubset::Clients(ids) = &self.evaluation.subset {
            if let Some(bad) = ids.iter().find(|&&c| c >= self.num_clients) {
                return fail(format!("evaluation client {} out of range", bad));
            }
        }
        Ok(())
    }

    /// Load from a `.toml` or `.json` file
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        let config = match ext {
            "toml" => toml::from_str::<RunConfig>(&content)
                .map_err(|e| FedError::Serialization(format!("{}: {}", path.display(), e)))?,
            "json" => serde_json::from_str::<RunConfig>(&content)
                .map_err(|e| FedError::Serialization(format!("{}: {}", path.display(), e)))?,
            other => {
                return Err(FedError::Config(format!(
                    "unsupported config extension {:?} for {}",
                    other,
                    path.display()
                )))
            }
        };
        tracing::debug!(path = %path.display(), name = %config.name, "Loaded run config");
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| FedError::Serialization(e.to_string()))
    }
}

/// Config files (`.toml`/`.json`) in `dir`, sorted by path
pub fn config_paths(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_config = matches!(path.extension().and_then(|e| e.to_str()), Some("toml") | Some("json"));
        if path.is_file() && is_config {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Every config in `dir`, in sorted path order
pub fn load_config_dir(dir: &Path) -> Result<Vec<RunConfig>> {
    config_paths(dir)?.iter().map(|p| RunConfig::from_path(p)).collect()
}

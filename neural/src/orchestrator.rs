// SPDX-License-Identifier: MIT OR Apache-2.0

//! Round orchestrator
//!
//! Drives one configuration through
//! `Init -> (SampleClients -> LocalTrain -> [Recluster] -> Aggregate -> [Evaluate])* -> Done`.
//! Rounds are strictly sequential; work inside a round fans out over the
//! worker pool and joins before the next phase starts.

use crate::cluster::{assigner_for, ClusterAssigner};
use crate::config::{EstimatorConfig, GroupConfig, RunConfig};
use crate::evaluation::{evaluate_clients, summarize, EvalCadence, RoundRecord};
use crate::federated::FederatedAggregator;
use crate::pool::WorkerPool;
use crate::similarity::{EmbeddingCentroid, EstimationInput, LabelOverlap, ParameterDistance, SimilarityEstimator};
use crate::storage::{ResultsWriter, RunCheckpoint};
use fedclust_core::logging::{PhaseTimer, RoundLogEntry, RunCorrelation};
use fedclust_core::partition::partition_splits;
use fedclust_core::{
    derive_seed, ClientId, ClusterSpec, DatasetLabels, EmbeddingCollaborator, Evaluator, FedError, Label,
    LocalTrainer, MembershipMatrix, ModelFactory, ModelParams, PartitionMap, Result, SplitPartition, Stage,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// Seed streams
const STREAM_SPEC: u64 = 1;
const STREAM_PARTITION: u64 = 2;
const STREAM_MODEL: u64 = 3;
const STREAM_SAMPLE: u64 = 4;
const STREAM_TRAIN: u64 = 5;
const STREAM_CLUSTER: u64 = 6;

/// External collaborators a run calls into
#[derive(Clone)]
pub struct Collaborators {
    pub trainer: Arc<dyn LocalTrainer>,
    pub evaluator: Arc<dyn Evaluator>,
    pub factory: Arc<dyn ModelFactory>,
    /// Only needed by the embedding-centroid estimator
    pub embedder: Option<Arc<dyn EmbeddingCollaborator>>,
}

/// Cooperative stop signal, checked between rounds
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Orchestrator state machine phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    Init,
    SampleClients,
    LocalTrain,
    Recluster,
    Aggregate,
    Evaluate,
    Done,
}

impl RoundPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundPhase::Init => "init",
            RoundPhase::SampleClients => "sample_clients",
            RoundPhase::LocalTrain => "local_train",
            RoundPhase::Recluster => "recluster",
            RoundPhase::Aggregate => "aggregate",
            RoundPhase::Evaluate => "evaluate",
            RoundPhase::Done => "done",
        }
    }
}

impl fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable per-run state, rebuilt for every configuration
#[derive(Debug, Clone)]
pub struct RoundState {
    /// Next round to run
    pub round: usize,
    pub params: Vec<ModelParams>,
    pub membership: MembershipMatrix,
    /// Mean training loss of each finished round
    pub mean_losses: Vec<f64>,
    /// Per-client loss, one entry per round the client trained
    pub client_losses: Vec<Vec<f64>>,
}

impl RoundState {
    fn new(params: Vec<ModelParams>, membership: MembershipMatrix) -> Self {
        let n = params.len();
        Self {
            round: 0,
            params,
            membership,
            mean_losses: Vec::new(),
            client_losses: vec![Vec::new(); n],
        }
    }
}

/// Everything a finished (or cancelled) run hands back
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub config_name: String,
    pub run_id: String,
    pub params: Vec<ModelParams>,
    pub membership: MembershipMatrix,
    pub history: Vec<RoundRecord>,
    pub mean_losses: Vec<f64>,
    pub client_losses: Vec<Vec<f64>>,
    pub completed_rounds: usize,
    pub cancelled: bool,
    /// Cluster spec and partition in force at the end of the run
    pub spec: ClusterSpec,
    pub partition: SplitPartition,
}

impl RunOutcome {
    pub fn to_checkpoint(&self) -> RunCheckpoint {
        RunCheckpoint {
            version: RunCheckpoint::CURRENT_VERSION,
            config_name: self.config_name.clone(),
            run_id: self.run_id.clone(),
            saved_at: chrono::Utc::now().to_rfc3339(),
            rounds_completed: self.completed_rounds,
            params: self.params.clone(),
            membership: self.membership.clone(),
            mean_losses: self.mean_losses.clone(),
            client_losses: self.client_losses.clone(),
        }
    }
}

/// Runs one configuration end to end
pub struct RoundOrchestrator {
    config: RunConfig,
    labels: DatasetLabels,
    collaborators: Collaborators,
    pool: WorkerPool,
    results_dir: Option<PathBuf>,
    cancel: CancellationToken,
}

impl RoundOrchestrator {
    /// Validate the configuration against the dataset and collaborators
    pub fn new(config: RunConfig, labels: DatasetLabels, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        if matches!(config.estimator, Some(EstimatorConfig::EmbeddingCentroid { .. }))
            && config.clustering.needs_estimator()
            && collaborators.embedder.is_none()
        {
            return Err(FedError::Config(format!(
                "{}: embedding-centroid estimator needs an embedding collaborator",
                config.name
            )));
        }
        let pool = config.workers.map_or_else(WorkerPool::available, WorkerPool::new);
        Ok(Self {
            config,
            labels,
            collaborators,
            pool,
            results_dir: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Write CSV summaries (and optional snapshots/checkpoint) into `dir`
    pub fn with_results_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.results_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    fn num_labels(&self) -> usize {
        self.labels
            .train
            .iter()
            .chain(&self.labels.test)
            .max()
            .map_or(0, |&max| max as usize + 1)
    }

    fn build_spec(&self, groups: &GroupConfig, overlap: f64, event: u64) -> Result<ClusterSpec> {
        let num_labels = self.num_labels();
        let spec = match groups.labels_per_group {
            None if overlap == 0.0 => ClusterSpec::balanced(num_labels, groups.num_groups)?,
            lpg => {
                let labels_per_group = lpg.unwrap_or_else(|| (num_labels / groups.num_groups).max(1));
                let mut rng = StdRng::seed_from_u64(derive_seed(self.config.seed, STREAM_SPEC, event));
                ClusterSpec::generate(num_labels, groups.num_groups, labels_per_group, overlap, &mut rng)?
            }
        };
        if !spec.has_overlap() {
            spec.validate_coverage(&self.labels.train)?;
        }
        Ok(spec)
    }

    fn build_partition(&self, spec: &ClusterSpec, event: u64) -> Result<SplitPartition> {
        partition_splits(
            &self.labels,
            self.config.num_clients,
            spec,
            &self.config.skew,
            derive_seed(self.config.seed, STREAM_PARTITION, event),
        )
    }

    fn build_estimator(&self) -> Option<Box<dyn SimilarityEstimator>> {
        let seed = derive_seed(self.config.seed, STREAM_CLUSTER, 0);
        match self.config.estimator? {
            EstimatorConfig::LabelOverlap => Some(Box::new(LabelOverlap)),
            EstimatorConfig::EmbeddingCentroid {
                threshold,
                target_dim,
                reducer,
            } => {
                let embedder = self.collaborators.embedder.clone()?;
                Some(Box::new(EmbeddingCentroid::new(
                    embedder,
                    threshold?,
                    target_dim,
                    reducer,
                    seed,
                )))
            }
            EstimatorConfig::ParameterDistance { num_clusters, n_init } => {
                Some(Box::new(ParameterDistance::new(num_clusters, n_init, seed)))
            }
        }
    }

    /// Sorted ids of the clients training in `round`
    fn sample_clients(&self, round: usize) -> Vec<ClientId> {
        let n = self.config.num_clients;
        let m = self.config.clients_per_round();
        if m >= n {
            return (0..n).collect();
        }
        let mut rng = StdRng::seed_from_u64(derive_seed(self.config.seed, STREAM_SAMPLE, round as u64));
        let mut ids = rand::seq::index::sample(&mut rng, n, m).into_vec();
        ids.sort_unstable();
        ids
    }

    /// Run every round, or until cancelled
    pub fn run(&self) -> Result<RunOutcome> {
        let config = &self.config;
        let n = config.num_clients;
        let corr = RunCorrelation::new(&config.name);

        // Init: everything fallible about the setup happens before any file is written
        let init_timer = PhaseTimer::new(RoundPhase::Init.as_str(), corr.clone());
        let mut spec = self.build_spec(&config.groups, config.groups.overlap, 0)?;
        let mut partition = self.build_partition(&spec, 0)?;
        let assigner: Box<dyn ClusterAssigner> =
            assigner_for(&config.clustering, derive_seed(config.seed, STREAM_CLUSTER, 1));
        let mut estimator = if assigner.uses_similarity() {
            Some(self.build_estimator().ok_or_else(|| {
                FedError::Config(format!("{}: {} clustering has no usable estimator", config.name, assigner.name()))
            })?)
        } else {
            None
        };
        // The post-switch spec and partition are built now so an infeasible switch fails before round 0
        let mut switched = match config.dataset_switch {
            Some(switch) => {
                let next_spec = self.build_spec(&config.groups, switch.overlap, 1)?;
                let next_partition = self.build_partition(&next_spec, 1)?;
                Some((next_spec, next_partition))
            }
            None => None,
        };
        if estimator.is_some() && matches!(config.estimator, Some(EstimatorConfig::EmbeddingCentroid { .. })) {
            check_two_samples(&partition.train)?;
            if let Some((_, next_partition)) = &switched {
                check_two_samples(&next_partition.train)?;
            }
        }
        let evaluated = config.evaluation.subset.resolve(&partition.train)?;
        let initial = self
            .collaborators
            .factory
            .init(derive_seed(config.seed, STREAM_MODEL, 0))
            .map_err(|e| FedError::collaborator(Stage::ModelInit, 0, e))?;
        let mut writer = match &self.results_dir {
            Some(dir) => Some(ResultsWriter::create(dir, &config.name, &evaluated)?),
            None => None,
        };
        let mut state = RoundState::new(vec![initial; n], assigner.initial_membership(n));
        let aggregator = FederatedAggregator::new(config.inactive);
        drop(init_timer);

        tracing::info!(
            run = %corr.run_id,
            config = %config.name,
            clients = n,
            rounds = config.rounds,
            clustering = assigner.name(),
            estimator = estimator.as_ref().map_or("none", |e| e.name()),
            skew = config.skew.name(),
            workers = self.pool.workers(),
            "Starting run"
        );

        let mut history = Vec::with_capacity(config.rounds);
        let mut switch_pending = false;
        let mut cancelled = false;

        for round in 0..config.rounds {
            if self.cancel.is_cancelled() {
                tracing::info!(run = %corr.run_id, round, "Run cancelled");
                cancelled = true;
                break;
            }
            let round_corr = corr.with_round(round);

            let active = {
                let _t = PhaseTimer::new(RoundPhase::SampleClients.as_str(), round_corr.clone());
                self.sample_clients(round)
            };

            let trained = {
                let _t = PhaseTimer::new(RoundPhase::LocalTrain.as_str(), round_corr.clone());
                let round_seed = derive_seed(config.seed, STREAM_TRAIN, round as u64);
                let trainer = &self.collaborators.trainer;
                let params = &state.params;
                let train_partition = &partition.train;
                self.pool.run(&active, |client| {
                    trainer
                        .train(
                            client,
                            &params[client],
                            train_partition.indices(client),
                            derive_seed(round_seed, 0, client as u64),
                        )
                        .map_err(|e| FedError::collaborator(Stage::LocalTrain, client, e))
                })?
            };

            let mut loss_sum = 0.0f64;
            for (client, outcome) in trained {
                loss_sum += outcome.loss as f64;
                state.client_losses[client].push(outcome.loss as f64);
                state.params[client] = outcome.params;
            }
            let mean_train_loss = loss_sum / active.len() as f64;
            state.mean_losses.push(mean_train_loss);

            let reclustered = match estimator.as_mut() {
                Some(estimator) if config.recluster.due(round, switch_pending) => {
                    let _t = PhaseTimer::new(RoundPhase::Recluster.as_str(), round_corr.clone());
                    let input = EstimationInput {
                        partition: &partition.train,
                        labels: &self.labels.train,
                        params: &state.params,
                        pool: &self.pool,
                    };
                    let report = estimator.estimate(&input)?;
                    state.membership = assigner.assign(n, Some(&report))?;
                    switch_pending = false;
                    tracing::debug!(
                        round,
                        neighbourhoods = state.membership.distinct_rows(),
                        "Reclustered"
                    );
                    if let Some(writer) = writer.as_ref().filter(|_| config.artifacts.membership_snapshots) {
                        writer.write_membership_snapshot(round, &state.membership)?;
                    }
                    true
                }
                _ => false,
            };

            {
                let _t = PhaseTimer::new(RoundPhase::Aggregate.as_str(), round_corr.clone());
                let mut flags = vec![false; n];
                for &client in &active {
                    flags[client] = true;
                }
                state.params = aggregator.aggregate(&state.params, &state.membership, &flags)?;
            }

            let evaluate_now = match config.evaluation.cadence {
                EvalCadence::EveryRound => true,
                EvalCadence::RunEnd => round + 1 == config.rounds,
            };
            let evaluation = if evaluate_now {
                let _t = PhaseTimer::new(RoundPhase::Evaluate.as_str(), round_corr.clone());
                let scores = evaluate_clients(
                    self.collaborators.evaluator.as_ref(),
                    &state.params,
                    &partition,
                    &evaluated,
                    &self.pool,
                )?;
                Some(summarize(scores, config.evaluation.weighting))
            } else {
                None
            };

            let record = RoundRecord {
                round,
                mean_train_loss,
                active_clients: active,
                reclustered,
                evaluation,
            };
            if let Some(writer) = writer.as_mut() {
                writer.record_round(&record)?;
            }
            RoundLogEntry::new("round_complete", round_corr)
                .with_fields(serde_json::json!({
                    "mean_train_loss": record.mean_train_loss,
                    "active_clients": record.active_clients.len(),
                    "reclustered": record.reclustered,
                    "train_accuracy": record.evaluation.as_ref().map(|e| e.train_accuracy),
                    "test_accuracy": record.evaluation.as_ref().map(|e| e.test_accuracy),
                }))
                .emit();
            history.push(record);
            state.round = round + 1;

            if let Some(switch) = config.dataset_switch.filter(|s| s.round == round + 1) {
                if let Some((next_spec, next_partition)) = switched.take() {
                    spec = next_spec;
                    partition = next_partition;
                    switch_pending = true;
                    tracing::info!(
                        run = %corr.run_id,
                        next_round = switch.round,
                        groups = ?spec.groups(),
                        "Dataset switched"
                    );
                }
            }
        }

        let _done = PhaseTimer::new(RoundPhase::Done.as_str(), corr.clone());
        let outcome = RunOutcome {
            config_name: config.name.clone(),
            run_id: corr.run_id.clone(),
            params: state.params,
            membership: state.membership,
            history,
            mean_losses: state.mean_losses,
            client_losses: state.client_losses,
            completed_rounds: state.round,
            cancelled,
            spec,
            partition,
        };

        if let Some(writer) = writer {
            if config.artifacts.checkpoint {
                writer.save_checkpoint(&outcome.to_checkpoint())?;
            }
            writer.finish()?;
        }

        tracing::info!(
            run = %corr.run_id,
            config = %config.name,
            rounds = outcome.completed_rounds,
            cancelled,
            "Run finished"
        );
        Ok(outcome)
    }
}

/// The k=2 centroid fit needs at least two training samples per client
fn check_two_samples(partition: &PartitionMap) -> Result<()> {
    match (0..partition.num_clients()).find(|&c| partition.indices(c).len() < 2) {
        Some(client) => Err(FedError::Config(format!(
            "client {} holds {} training samples, embedding centroids need at least 2",
            client,
            partition.indices(client).len()
        ))),
        None => Ok(()),
    }
}

/// Labels of the train split seen by each client, for diagnostics
pub fn client_label_sets(partition: &SplitPartition, labels: &DatasetLabels) -> Vec<Vec<Label>> {
    (0..partition.train.num_clients())
        .map(|c| {
            let mut seen: Vec<Label> = partition.train.indices(c).iter().map(|&i| labels.train[i]).collect();
            seen.sort_unstable();
            seen.dedup();
            seen
        })
        .collect()
}

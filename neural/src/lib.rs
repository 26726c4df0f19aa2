// SPDX-License-Identifier: MIT OR Apache-2.0

//! fedclust neural - clustering, aggregation and round orchestration
//!
//! This crate provides:
//! - Similarity estimators (label overlap, embedding centroids, parameter k-means)
//! - Cluster assigners that turn similarity into a membership matrix
//! - Membership-weighted parameter aggregation
//! - The round orchestrator and its worker pool
//! - Run configuration, evaluation and result artifacts
//! - A small softmax model on synthetic data usable as the collaborators

#![deny(clippy::all)]

pub mod cluster;
pub mod config;
pub mod evaluation;
pub mod federated;
pub mod kmeans;
pub mod orchestrator;
pub mod pool;
pub mod similarity;
pub mod simple_net;
pub mod storage;

// Re-export key types
pub use cluster::{assigner_for, ClusterAssigner, ReclusterSchedule};
pub use config::{load_config_dir, ClusteringMethod, EstimatorConfig, RunConfig};
pub use evaluation::{EvalSummary, RoundRecord};
pub use federated::{FederatedAggregator, InactivePolicy};
pub use orchestrator::{CancellationToken, Collaborators, RoundOrchestrator, RunOutcome};
pub use pool::WorkerPool;
pub use similarity::{SimilarityEstimator, SimilarityReport};
pub use simple_net::{ProjectionEmbedder, SoftmaxModel, SyntheticDataset, SyntheticShape};
pub use storage::{load_checkpoint, ResultsWriter, RunCheckpoint};

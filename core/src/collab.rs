//! Contracts for the external collaborators
//!
//! The orchestration core never trains, embeds or evaluates anything itself.
//! It calls these traits and treats every failure as fatal for the round.

use serde::{Deserialize, Serialize};

use crate::{ClientId, Label, ModelParams, Split};

/// What a local training step hands back
#[derive(Debug, Clone, PartialEq)]
pub struct TrainOutcome {
    /// Updated parameters
    pub params: ModelParams,
    /// Training loss reported by the optimizer
    pub loss: f32,
}

/// Accuracy and loss of one model on one index set
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Fraction of correct predictions in `[0, 1]`
    pub accuracy: f64,
    pub loss: f64,
}

/// Embedding vectors plus the labels seen while extracting them
#[derive(Debug, Clone, PartialEq)]
pub struct Embedded {
    /// One fixed-dimension vector per sample, in index order
    pub vectors: Vec<Vec<f64>>,
    /// Label of each sample as recorded at extraction time
    pub labels: Vec<Label>,
}

/// Local optimizer
///
/// Must be deterministic for a fixed `seed` and identical inputs.
pub trait LocalTrainer: Send + Sync {
    fn train(
        &self,
        client: ClientId,
        params: &ModelParams,
        indices: &[usize],
        seed: u64,
    ) -> anyhow::Result<TrainOutcome>;
}

/// Accuracy/loss of a model on an index subset of one split
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, params: &ModelParams, split: Split, indices: &[usize]) -> anyhow::Result<Evaluation>;
}

/// Builds the freshly initialised model every client starts from
pub trait ModelFactory: Send + Sync {
    fn init(&self, seed: u64) -> anyhow::Result<ModelParams>;
}

/// Autoencoder embedding plus low-dimensional manifold reduction
pub trait EmbeddingCollaborator: Send + Sync {
    /// Embed the training samples at `indices`
    fn embed(&self, client: ClientId, indices: &[usize]) -> anyhow::Result<Embedded>;

    /// Map `vectors` to `target_dim` dimensions
    fn reduce(&self, vectors: &[Vec<f64>], target_dim: usize) -> anyhow::Result<Vec<Vec<f64>>>;
}

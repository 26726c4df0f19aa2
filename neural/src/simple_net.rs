//! Small reference collaborators
//!
//! A synthetic Gaussian-blob dataset, a softmax-regression model that trains
//! and evaluates on it, and a random-projection embedder. They let the
//! orchestrator run end to end without an external ML stack.

use anyhow::{bail, Context};
use fedclust_core::{
    ClientId, DatasetLabels, Embedded, EmbeddingCollaborator, Evaluation, Evaluator, FedError, Label, LocalTrainer,
    ModelFactory, ModelParams, Result, Split, Tensor, TrainOutcome,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const WEIGHT: &str = "linear.weight";
const BIAS: &str = "linear.bias";

/// Size and spread of a synthetic dataset
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SyntheticShape {
    pub num_labels: usize,
    pub train_per_label: usize,
    pub test_per_label: usize,
    pub dim: usize,
    /// Standard deviation of each blob around its center
    pub spread: f64,
}

impl Default for SyntheticShape {
    fn default() -> Self {
        Self {
            num_labels: 10,
            train_per_label: 300,
            test_per_label: 60,
            dim: 16,
            spread: 1.0,
        }
    }
}

/// Features of one split
#[derive(Debug, Clone)]
struct LabelledSplit {
    features: Vec<Vec<f32>>,
    labels: Vec<Label>,
}

/// One Gaussian blob per label; samples interleave labels
#[derive(Debug, Clone)]
pub struct SyntheticDataset {
    shape: SyntheticShape,
    train: LabelledSplit,
    test: LabelledSplit,
}

impl SyntheticDataset {
    pub fn generate(shape: SyntheticShape, seed: u64) -> Result<Self> {
        if shape.num_labels == 0 || shape.dim == 0 || shape.train_per_label == 0 {
            return Err(FedError::Config(format!("degenerate synthetic dataset shape {:?}", shape)));
        }
        let noise = Normal::new(0.0, shape.spread)
            .map_err(|e| FedError::Config(format!("invalid blob spread {}: {}", shape.spread, e)))?;
        let unit = Normal::new(0.0, 1.0).map_err(|e| FedError::Config(e.to_string()))?;

        let mut rng = StdRng::seed_from_u64(seed);
        // Centers far apart relative to unit spread
        let centers: Vec<Vec<f64>> = (0..shape.num_labels)
            .map(|_| (0..shape.dim).map(|_| 4.0 * unit.sample(&mut rng)).collect())
            .collect();

        let mut draw = |per_label: usize| {
            let mut split = LabelledSplit {
                features: Vec::with_capacity(per_label * shape.num_labels),
                labels: Vec::with_capacity(per_label * shape.num_labels),
            };
            for _ in 0..per_label {
                for (label, center) in centers.iter().enumerate() {
                    split
                        .features
                        .push(center.iter().map(|c| (c + noise.sample(&mut rng)) as f32).collect());
                    split.labels.push(label as Label);
                }
            }
            split
        };
        let train = draw(shape.train_per_label);
        let test = draw(shape.test_per_label);

        tracing::debug!(
            labels = shape.num_labels,
            train = train.labels.len(),
            test = test.labels.len(),
            "Generated synthetic dataset"
        );
        Ok(Self { shape, train, test })
    }

    pub fn shape(&self) -> SyntheticShape {
        self.shape
    }

    /// Labels of both splits, as the partitioner needs them
    pub fn labels(&self) -> DatasetLabels {
        DatasetLabels {
            train: self.train.labels.clone(),
            test: self.test.labels.clone(),
        }
    }

    pub fn features(&self, split: Split) -> &[Vec<f32>] {
        match split {
            Split::Train => &self.train.features,
            Split::Test => &self.test.features,
        }
    }

    fn split(&self, split: Split) -> &LabelledSplit {
        match split {
            Split::Train => &self.train,
            Split::Test => &self.test,
        }
    }
}

/// Multinomial logistic regression trained by minibatch SGD
#[derive(Debug, Clone)]
pub struct SoftmaxModel {
    data: Arc<SyntheticDataset>,
    learning_rate: f32,
    epochs: usize,
    batch_size: usize,
}

impl SoftmaxModel {
    pub fn new(data: Arc<SyntheticDataset>) -> Self {
        Self {
            data,
            learning_rate: 0.05,
            epochs: 1,
            batch_size: 10,
        }
    }

    pub fn with_learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs.max(1);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    fn classes(&self) -> usize {
        self.data.shape.num_labels
    }

    fn dim(&self) -> usize {
        self.data.shape.dim
    }

    fn unpack<'a>(&self, params: &'a ModelParams) -> anyhow::Result<(&'a [f32], &'a [f32])> {
        let weight = params.get(WEIGHT).context("missing linear.weight")?;
        let bias = params.get(BIAS).context("missing linear.bias")?;
        if weight.shape() != [self.classes(), self.dim()].as_slice() || bias.shape() != [self.classes()].as_slice() {
            bail!(
                "expected weight {:?} and bias {:?}, got {:?} and {:?}",
                [self.classes(), self.dim()],
                [self.classes()],
                weight.shape(),
                bias.shape()
            );
        }
        Ok((weight.data(), bias.data()))
    }

    /// Softmax probabilities for one sample
    fn probabilities(&self, weight: &[f32], bias: &[f32], x: &[f32]) -> Vec<f32> {
        let dim = self.dim();
        let logits: Vec<f32> = (0..self.classes())
            .map(|k| {
                let row = &weight[k * dim..(k + 1) * dim];
                bias[k] + row.iter().zip(x).map(|(w, v)| w * v).sum::<f32>()
            })
            .collect();
        let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let exp: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
        let sum: f32 = exp.iter().sum();
        exp.into_iter().map(|e| e / sum).collect()
    }
}

fn cross_entropy(probs: &[f32], label: Label) -> f32 {
    -probs[label as usize].max(1e-12).ln()
}

impl ModelFactory for SoftmaxModel {
    fn init(&self, seed: u64) -> anyhow::Result<ModelParams> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0f32, 0.01)?;
        let weight: Vec<f32> = (0..self.classes() * self.dim()).map(|_| normal.sample(&mut rng)).collect();
        Ok(ModelParams::new()
            .with(WEIGHT, Tensor::new(vec![self.classes(), self.dim()], weight)?)
            .with(BIAS, Tensor::zeros(vec![self.classes()])))
    }
}

impl LocalTrainer for SoftmaxModel {
    fn train(&self, client: ClientId, params: &ModelParams, indices: &[usize], seed: u64) -> anyhow::Result<TrainOutcome> {
        if indices.is_empty() {
            bail!("client {} has no training samples", client);
        }
        let (weight, bias) = self.unpack(params)?;
        let mut weight = weight.to_vec();
        let mut bias = bias.to_vec();
        let data = &self.data.train;
        let dim = self.dim();

        let mut rng = StdRng::seed_from_u64(seed);
        let mut order = indices.to_vec();
        let mut epoch_loss = 0.0f32;
        for _ in 0..self.epochs {
            order.shuffle(&mut rng);
            epoch_loss = 0.0;
            for batch in order.chunks(self.batch_size) {
                let mut grad_w = vec![0.0f32; weight.len()];
                let mut grad_b = vec![0.0f32; bias.len()];
                for &idx in batch {
                    let x = &data.features[idx];
                    let label = data.labels[idx];
                    let mut probs = self.probabilities(&weight, &bias, x);
                    epoch_loss += cross_entropy(&probs, label);
                    probs[label as usize] -= 1.0;
                    for (k, g) in probs.iter().enumerate() {
                        grad_b[k] += g;
                        for (gw, v) in grad_w[k * dim..(k + 1) * dim].iter_mut().zip(x) {
                            *gw += g * v;
                        }
                    }
                }
                let step = self.learning_rate / batch.len() as f32;
                for (w, g) in weight.iter_mut().zip(&grad_w) {
                    *w -= step * g;
                }
                for (b, g) in bias.iter_mut().zip(&grad_b) {
                    *b -= step * g;
                }
            }
        }

        let params = ModelParams::new()
            .with(WEIGHT, Tensor::new(vec![self.classes(), dim], weight)?)
            .with(BIAS, Tensor::new(vec![self.classes()], bias)?);
        Ok(TrainOutcome {
            params,
            loss: epoch_loss / indices.len() as f32,
        })
    }
}

impl Evaluator for SoftmaxModel {
    fn evaluate(&self, params: &ModelParams, split: Split, indices: &[usize]) -> anyhow::Result<Evaluation> {
        let (weight, bias) = self.unpack(params)?;
        if indices.is_empty() {
            return Ok(Evaluation {
                accuracy: 0.0,
                loss: 0.0,
            });
        }
        let data = self.data.split(split);
        let mut correct = 0usize;
        let mut loss = 0.0f64;
        for &idx in indices {
            let x = data
                .features
                .get(idx)
                .with_context(|| format!("{} index {} out of range", split, idx))?;
            let label = data.labels[idx];
            let probs = self.probabilities(weight, bias, x);
            let predicted = probs
                .iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (k, &p)| if p > best.1 { (k, p) } else { best })
                .0;
            if predicted == label as usize {
                correct += 1;
            }
            loss += cross_entropy(&probs, label) as f64;
        }
        Ok(Evaluation {
            accuracy: correct as f64 / indices.len() as f64,
            loss: loss / indices.len() as f64,
        })
    }
}

/// Raw features as embeddings, seeded Gaussian random projection as reducer
#[derive(Debug, Clone)]
pub struct ProjectionEmbedder {
    data: Arc<SyntheticDataset>,
    seed: u64,
}

impl ProjectionEmbedder {
    pub fn new(data: Arc<SyntheticDataset>, seed: u64) -> Self {
        Self { data, seed }
    }
}

impl EmbeddingCollaborator for ProjectionEmbedder {
    fn embed(&self, _client: ClientId, indices: &[usize]) -> anyhow::Result<Embedded> {
        let train = &self.data.train;
        let mut vectors = Vec::with_capacity(indices.len());
        let mut labels = Vec::with_capacity(indices.len());
        for &idx in indices {
            let x = train.features.get(idx).with_context(|| format!("train index {} out of range", idx))?;
            vectors.push(x.iter().map(|&v| v as f64).collect());
            labels.push(train.labels[idx]);
        }
        Ok(Embedded { vectors, labels })
    }

    fn reduce(&self, vectors: &[Vec<f64>], target_dim: usize) -> anyhow::Result<Vec<Vec<f64>>> {
        let Some(first) = vectors.first() else {
            return Ok(Vec::new());
        };
        let dim = first.len();
        if vectors.iter().any(|v| v.len() != dim) {
            bail!("embedding vectors have mixed dimensions");
        }

        // Same projection on every call, so per-client fits stay comparable
        let mut rng = StdRng::seed_from_u64(self.seed);
        let normal = Normal::new(0.0, 1.0 / (target_dim.max(1) as f64).sqrt())?;
        let projection: Vec<Vec<f64>> = (0..target_dim)
            .map(|_| (0..dim).map(|_| normal.sample(&mut rng)).collect())
            .collect();

        Ok(vectors
            .iter()
            .map(|v| {
                projection
                    .iter()
                    .map(|row| row.iter().zip(v).map(|(p, x)| p * x).sum())
                    .collect()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> Arc<SyntheticDataset> {
        let shape = SyntheticShape {
            num_labels: 3,
            train_per_label: 40,
            test_per_label: 10,
            dim: 4,
            spread: 0.5,
        };
        Arc::new(SyntheticDataset::generate(shape, 5).unwrap())
    }

    #[test]
    fn test_dataset_layout() {
        let data = small();
        let labels = data.labels();
        assert_eq!(labels.train.len(), 120);
        assert_eq!(labels.test.len(), 30);
        assert_eq!(&labels.train[..4], &[0, 1, 2, 0]);
        assert_eq!(data.features(Split::Test)[0].len(), 4);
    }

    #[test]
    fn test_generation_is_seeded() {
        let shape = small().shape();
        let a = SyntheticDataset::generate(shape, 9).unwrap();
        let b = SyntheticDataset::generate(shape, 9).unwrap();
        assert_eq!(a.features(Split::Train), b.features(Split::Train));
    }

    #[test]
    fn test_training_reduces_loss() {
        let data = small();
        let model = SoftmaxModel::new(data.clone()).with_learning_rate(0.01).with_epochs(5);
        let indices: Vec<usize> = (0..120).collect();
        let init = model.init(1).unwrap();
        let before = model.evaluate(&init, Split::Train, &indices).unwrap();
        let trained = model.train(0, &init, &indices, 2).unwrap();
        let after = model.evaluate(&trained.params, Split::Train, &indices).unwrap();
        assert!(after.loss < before.loss);
        assert!(after.accuracy > 0.8);
    }

    #[test]
    fn test_training_is_deterministic() {
        let model = SoftmaxModel::new(small());
        let init = model.init(3).unwrap();
        let idx = [0, 5, 9, 33, 71];
        let a = model.train(0, &init, &idx, 8).unwrap();
        let b = model.train(0, &init, &idx, 8).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_training_set_fails() {
        let model = SoftmaxModel::new(small());
        let init = model.init(0).unwrap();
        assert!(model.train(4, &init, &[], 0).is_err());
    }

    #[test]
    fn test_wrong_topology_rejected() {
        let model = SoftmaxModel::new(small());
        let params = ModelParams::new().with(WEIGHT, Tensor::zeros(vec![2, 2]));
        assert!(model.evaluate(&params, Split::Test, &[0]).is_err());
    }

    #[test]
    fn test_projection_embedder() {
        let data = small();
        let embedder = ProjectionEmbedder::new(data.clone(), 4);
        let embedded = embedder.embed(0, &[2, 0, 1]).unwrap();
        assert_eq!(embedded.labels, vec![2, 0, 1]);
        let reduced = embedder.reduce(&embedded.vectors, 2).unwrap();
        assert_eq!(reduced.len(), 3);
        assert!(reduced.iter().all(|v| v.len() == 2));
        assert_eq!(reduced, embedder.reduce(&embedded.vectors, 2).unwrap());
    }
}

//! Named-parameter model representation
//!
//! Models are opaque bags of tensors keyed by a stable parameter name. Keys
//! live in a `BTreeMap`, so every client iterates them in the same order and
//! `flatten` yields comparable vectors.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{FedError, Result};

/// Dense tensor with row-major `f32` storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Create a tensor, checking that `data` fills `shape`
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(FedError::Config(format!(
                "tensor of shape {:?} needs {} values, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Zero-filled tensor
    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// First difference found between two parameter topologies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyMismatch {
    /// Parameter name
    pub param: String,
    /// Shape on the left-hand side (empty if missing)
    pub expected: Vec<usize>,
    /// Shape on the right-hand side (empty if missing)
    pub actual: Vec<usize>,
}

/// Ordered mapping from parameter name to tensor
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelParams {
    tensors: BTreeMap<String, Tensor>,
}

impl ModelParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a parameter
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.insert(name, tensor);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        self.tensors.get_mut(name)
    }

    /// Parameters in stable key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.tensors.iter().map(|(name, tensor)| (name.as_str(), tensor))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Tensor)> {
        self.tensors.iter_mut().map(|(name, tensor)| (name.as_str(), tensor))
    }

    /// Number of named parameters
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Total scalar count across all tensors
    pub fn num_elements(&self) -> usize {
        self.tensors.values().map(Tensor::len).sum()
    }

    /// Concatenate every tensor in key order into one vector
    pub fn flatten(&self) -> Vec<f64> {
        let mut flat = Vec::with_capacity(self.num_elements());
        for tensor in self.tensors.values() {
            flat.extend(tensor.data().iter().map(|&v| v as f64));
        }
        flat
    }

    /// Compare names and shapes against `other`
    ///
    /// Returns the first parameter (in key order) whose presence or shape
    /// differs, or `None` when both share one topology.
    pub fn topology_mismatch(&self, other: &ModelParams) -> Option<TopologyMismatch> {
        for (name, tensor) in &self.tensors {
            match other.tensors.get(name) {
                Some(theirs) if theirs.shape() == tensor.shape() => {}
                Some(theirs) => {
                    return Some(TopologyMismatch {
                        param: name.clone(),
                        expected: tensor.shape().to_vec(),
                        actual: theirs.shape().to_vec(),
                    })
                }
                None => {
                    return Some(TopologyMismatch {
                        param: name.clone(),
                        expected: tensor.shape().to_vec(),
                        actual: Vec::new(),
                    })
                }
            }
        }
        other
            .tensors
            .iter()
            .find(|(name, _)| !self.tensors.contains_key(*name))
            .map(|(name, tensor)| TopologyMismatch {
                param: name.clone(),
                expected: Vec::new(),
                actual: tensor.shape().to_vec(),
            })
    }

    /// Largest absolute element-wise difference; `None` if topologies differ
    pub fn max_abs_diff(&self, other: &ModelParams) -> Option<f32> {
        if self.topology_mismatch(other).is_some() {
            return None;
        }
        let mut max = 0.0f32;
        for (name, tensor) in &self.tensors {
            let theirs = &other.tensors[name];
            for (a, b) in tensor.data().iter().zip(theirs.data()) {
                max = max.max((a - b).abs());
            }
        }
        Some(max)
    }
}

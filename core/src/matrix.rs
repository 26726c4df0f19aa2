//! Affinity and membership matrices

use serde::{Deserialize, Serialize};

use crate::ClientId;

/// How to read affinity values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AffinityKind {
    /// Higher means closer
    Similarity,
    /// Lower means closer
    Distance,
}

/// N×N real matrix of pairwise client affinities
///
/// Rows are computed per origin client and are never mirrored, so a matrix
/// produced by an empirical estimator may be asymmetric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffinityMatrix {
    n: usize,
    kind: AffinityKind,
    values: Vec<f64>,
}

impl AffinityMatrix {
    /// Zero matrix of the given kind
    pub fn new(n: usize, kind: AffinityKind) -> Self {
        Self {
            n,
            kind,
            values: vec![0.0; n * n],
        }
    }

    /// Fill every cell from `f(row, col)`
    pub fn from_fn(n: usize, kind: AffinityKind, mut f: impl FnMut(ClientId, ClientId) -> f64) -> Self {
        let mut values = Vec::with_capacity(n * n);
        for i in 0..n {
            for j in 0..n {
                values.push(f(i, j));
            }
        }
        Self { n, kind, values }
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn kind(&self) -> AffinityKind {
        self.kind
    }

    pub fn get(&self, i: ClientId, j: ClientId) -> f64 {
        self.values[i * self.n + j]
    }

    pub fn set(&mut self, i: ClientId, j: ClientId, value: f64) {
        self.values[i * self.n + j] = value;
    }

    /// Row `i` as a slice
    pub fn row(&self, i: ClientId) -> &[f64] {
        &self.values[i * self.n..(i + 1) * self.n]
    }

    pub fn is_symmetric(&self, tolerance: f64) -> bool {
        (0..self.n).all(|i| (0..i).all(|j| (self.get(i, j) - self.get(j, i)).abs() <= tolerance))
    }
}

/// N×N binary matrix: row `i` lists who aggregates into client `i`
///
/// Every constructor and mutator keeps `M[i][i] == 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipMatrix {
    n: usize,
    cells: Vec<bool>,
}

impl MembershipMatrix {
    /// All ones: one global cluster
    pub fn ones(n: usize) -> Self {
        Self {
            n,
            cells: vec![true; n * n],
        }
    }

    /// Identity: every client on its own
    pub fn identity(n: usize) -> Self {
        Self::from_fn(n, |i, j| i == j)
    }

    /// Build from a predicate; the diagonal is forced to 1
    pub fn from_fn(n: usize, mut f: impl FnMut(ClientId, ClientId) -> bool) -> Self {
        let mut cells = Vec::with_capacity(n * n);
        for i in 0..n {
            for j in 0..n {
                cells.push(i == j || f(i, j));
            }
        }
        Self { n, cells }
    }

    /// Membership by equal cluster label
    pub fn from_labels(labels: &[usize]) -> Self {
        Self::from_fn(labels.len(), |i, j| labels[i] == labels[j])
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn get(&self, i: ClientId, j: ClientId) -> bool {
        self.cells[i * self.n + j]
    }

    /// Set a cell; writes to the diagonal are ignored
    pub fn set(&mut self, i: ClientId, j: ClientId, member: bool) {
        if i != j {
            self.cells[i * self.n + j] = member;
        }
    }

    /// Ids with `M[i][j] == 1`, ascending
    pub fn members(&self, i: ClientId) -> Vec<ClientId> {
        (0..self.n).filter(|&j| self.get(i, j)).collect()
    }

    /// Number of distinct rows, i.e. distinct aggregation neighbourhoods
    pub fn distinct_rows(&self) -> usize {
        let mut rows: Vec<&[bool]> = (0..self.n)
            .map(|i| &self.cells[i * self.n..(i + 1) * self.n])
            .collect();
        rows.sort();
        rows.dedup();
        rows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagonal_always_set() {
        let never = MembershipMatrix::from_fn(3, |_, _| false);
        for i in 0..3 {
            assert!(never.get(i, i));
        }
        let mut m = MembershipMatrix::identity(3);
        m.set(1, 1, false);
        assert!(m.get(1, 1));
    }

    #[test]
    fn test_from_labels() {
        let m = MembershipMatrix::from_labels(&[0, 1, 0, 1]);
        assert_eq!(m.members(0), vec![0, 2]);
        assert_eq!(m.members(3), vec![1, 3]);
        assert_eq!(m.distinct_rows(), 2);
        assert_eq!(MembershipMatrix::ones(4).distinct_rows(), 1);
    }

    #[test]
    fn test_affinity_symmetry_check() {
        let mut a = AffinityMatrix::from_fn(3, AffinityKind::Distance, |i, j| (i as f64 - j as f64).abs());
        assert!(a.is_symmetric(0.0));
        a.set(0, 2, 5.0);
        assert!(!a.is_symmetric(1e-9));
        assert_eq!(a.row(0), &[0.0, 1.0, 5.0]);
    }
}

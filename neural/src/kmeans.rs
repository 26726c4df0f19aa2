//! Lloyd's k-means with k-means++ seeding and warm starts
//!
//! Used both on per-client 2-D point clouds (k = 2) and on flattened model
//! parameter vectors. Runs are deterministic for a given seed.

use fedclust_core::{derive_seed, FedError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// How centers are initialised
#[derive(Debug, Clone, PartialEq)]
pub enum KMeansInit {
    /// k-means++ seeding, keeping the best of `n_init` restarts
    PlusPlus { n_init: usize },
    /// Start from the given centers, single run
    Centers(Vec<Vec<f64>>),
}

/// Result of one fit
#[derive(Debug, Clone, PartialEq)]
pub struct KMeansFit {
    pub centers: Vec<Vec<f64>>,
    /// Cluster index per input point
    pub labels: Vec<usize>,
    /// Within-cluster sum of squared distances
    pub inertia: f64,
    pub iterations: usize,
}

#[derive(Debug, Clone)]
pub struct KMeans {
    k: usize,
    max_iter: usize,
    tolerance: f64,
    seed: u64,
}

impl KMeans {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            max_iter: 300,
            tolerance: 1e-8,
            seed: 0,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter.max(1);
        self
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Cluster `points`
    pub fn fit(&self, points: &[Vec<f64>], init: &KMeansInit) -> Result<KMeansFit> {
        let dim = self.check_points(points)?;
        match init {
            KMeansInit::PlusPlus { n_init } => {
                let mut best: Option<KMeansFit> = None;
                for restart in 0..(*n_init).max(1) {
                    let mut rng = StdRng::seed_from_u64(derive_seed(self.seed, 0x6b6d, restart as u64));
                    let centers = plus_plus_centers(points, self.k, &mut rng);
                    let fit = self.lloyd(points, centers);
                    if best.as_ref().map_or(true, |b| fit.inertia < b.inertia) {
                        best = Some(fit);
                    }
                }
                best.ok_or_else(|| FedError::Config("k-means needs at least one restart".into()))
            }
            KMeansInit::Centers(centers) => {
                if centers.len() != self.k || centers.iter().any(|c| c.len() != dim) {
                    return Err(FedError::Config(format!(
                        "warm-start centers must be {} vectors of dimension {}",
                        self.k, dim
                    )));
                }
                Ok(self.lloyd(points, centers.clone()))
            }
        }
    }

    fn check_points(&self, points: &[Vec<f64>]) -> Result<usize> {
        if self.k == 0 {
            return Err(FedError::Config("k-means needs k >= 1".into()));
        }
        if points.len() < self.k {
            return Err(FedError::Config(format!(
                "k-means with k = {} needs at least {} points, got {}",
                self.k,
                self.k,
                points.len()
            )));
        }
        let dim = points[0].len();
        if dim == 0 || points.iter().any(|p| p.len() != dim) {
            return Err(FedError::Config("k-means points must share one non-zero dimension".into()));
        }
        Ok(dim)
    }

    fn lloyd(&self, points: &[Vec<f64>], mut centers: Vec<Vec<f64>>) -> KMeansFit {
        let dim = points[0].len();
        let mut labels = vec![usize::MAX; points.len()];
        let mut iterations = 0;

        for iter in 0..self.max_iter {
            iterations = iter + 1;
            let mut changed = false;
            for (p, point) in points.iter().enumerate() {
                let (nearest, _) = nearest_center(point, &centers);
                if labels[p] != nearest {
                    labels[p] = nearest;
                    changed = true;
                }
            }

            let mut sums = vec![vec![0.0; dim]; self.k];
            let mut counts = vec![0usize; self.k];
            for (point, &label) in points.iter().zip(&labels) {
                counts[label] += 1;
                for (s, v) in sums[label].iter_mut().zip(point) {
                    *s += v;
                }
            }

            let mut shift = 0.0f64;
            for c in 0..self.k {
                let updated = if counts[c] == 0 {
                    // Empty cluster: reseed at the point farthest from its center
                    let far = farthest_point(points, &labels, &centers);
                    labels[far] = c;
                    changed = true;
                    points[far].clone()
                } else {
                    sums[c].iter().map(|s| s / counts[c] as f64).collect()
                };
                shift = shift.max(squared_distance(&updated, &centers[c]));
                centers[c] = updated;
            }

            if !changed || shift <= self.tolerance {
                break;
            }
        }

        // Final assignment against the final centers
        let mut inertia = 0.0;
        for (p, point) in points.iter().enumerate() {
            let (nearest, dist) = nearest_center(point, &centers);
            labels[p] = nearest;
            inertia += dist;
        }

        KMeansFit {
            centers,
            labels,
            inertia,
            iterations,
        }
    }
}

pub fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Index and squared distance of the closest center; ties go to the lower index
fn nearest_center(point: &[f64], centers: &[Vec<f64>]) -> (usize, f64) {
    let mut best = (0, f64::INFINITY);
    for (c, center) in centers.iter().enumerate() {
        let d = squared_distance(point, center);
        if d < best.1 {
            best = (c, d);
        }
    }
    best
}

fn farthest_point(points: &[Vec<f64>], labels: &[usize], centers: &[Vec<f64>]) -> usize {
    let mut best = (0, -1.0);
    for (p, point) in points.iter().enumerate() {
        let d = squared_distance(point, &centers[labels[p].min(centers.len() - 1)]);
        if d > best.1 {
            best = (p, d);
        }
    }
    best.0
}

fn plus_plus_centers<R: Rng + ?Sized>(points: &[Vec<f64>], k: usize, rng: &mut R) -> Vec<Vec<f64>> {
    let mut centers = Vec::with_capacity(k);
    centers.push(points[rng.gen_range(0..points.len())].clone());

    let mut dists: Vec<f64> = points.iter().map(|p| squared_distance(p, &centers[0])).collect();
    while centers.len() < k {
        let total: f64 = dists.iter().sum();
        let next = if total > 0.0 {
            let mut target = rng.gen::<f64>() * total;
            let mut chosen = points.len() - 1;
            for (p, d) in dists.iter().enumerate() {
                if target < *d {
                    chosen = p;
                    break;
                }
                target -= d;
            }
            chosen
        } else {
            // All remaining points coincide with a center
            rng.gen_range(0..points.len())
        };
        centers.push(points[next].clone());
        let newest = &centers[centers.len() - 1];
        for (d, p) in dists.iter_mut().zip(points) {
            *d = d.min(squared_distance(p, newest));
        }
    }
    centers
}

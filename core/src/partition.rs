//! Non-IID dataset partitioning
//!
//! A [`ClusterSpec`] names which labels each client group sees and a
//! [`SkewPolicy`] decides how many samples each client draws. Every policy
//! accounts for every dataset index exactly once: either a client owns it or
//! it is recorded as unassigned. [`PartitionMap::validate`] enforces that
//! after each partition.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{derive_seed, ClientId, FedError, Label, Result};

/// Ordered sequence of label groups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    groups: Vec<Vec<Label>>,
}

impl ClusterSpec {
    /// Wrap explicit groups; each must be non-empty
    pub fn new(groups: Vec<Vec<Label>>) -> Result<Self> {
        if groups.is_empty() {
            return Err(FedError::Config("cluster spec needs at least one label group".into()));
        }
        if let Some(idx) = groups.iter().position(Vec::is_empty) {
            return Err(FedError::Config(format!("label group {} is empty", idx)));
        }
        Ok(Self { groups })
    }

    /// Contiguous label ranges; the last group takes the remainder
    pub fn balanced(num_labels: usize, num_groups: usize) -> Result<Self> {
        if num_groups == 0 || num_groups > num_labels {
            return Err(FedError::Config(format!(
                "cannot split {} labels into {} groups",
                num_labels, num_groups
            )));
        }
        let per_group = num_labels / num_groups;
        let groups = (0..num_groups)
            .map(|g| {
                let end = if g + 1 == num_groups { num_labels } else { (g + 1) * per_group };
                (g * per_group..end).map(|l| l as Label).collect()
            })
            .collect();
        Self::new(groups)
    }

    /// Random groups over a permutation of `0..num_labels`
    ///
    /// With `overlap == 0` the permutation is cut into consecutive disjoint
    /// groups. With `overlap` in `(0, 1)` groups are sliding windows that wrap
    /// around, and consecutive groups share `round(overlap * labels_per_group)`
    /// labels.
    pub fn generate<R: Rng + ?Sized>(
        num_labels: usize,
        num_groups: usize,
        labels_per_group: usize,
        overlap: f64,
        rng: &mut R,
    ) -> Result<Self> {
        if num_groups == 0 || labels_per_group == 0 {
            return Err(FedError::Config("need at least one group of at least one label".into()));
        }
        if labels_per_group > num_labels {
            return Err(FedError::Config(format!(
                "{} labels per group exceeds the {} available labels",
                labels_per_group, num_labels
            )));
        }
        if !(0.0..1.0).contains(&overlap) {
            return Err(FedError::Config(format!("overlap fraction {} not in [0, 1)", overlap)));
        }

        let mut perm: Vec<Label> = (0..num_labels as Label).collect();
        perm.shuffle(rng);

        let shared = (overlap * labels_per_group as f64).round() as usize;
        let groups = if shared == 0 {
            if num_groups * labels_per_group > num_labels {
                return Err(FedError::Config(format!(
                    "{} disjoint groups of {} labels need {} labels, dataset has {}",
                    num_groups,
                    labels_per_group,
                    num_groups * labels_per_group,
                    num_labels
                )));
            }
            perm.chunks(labels_per_group).take(num_groups).map(<[Label]>::to_vec).collect()
        } else {
            let step = labels_per_group - shared.min(labels_per_group - 1);
            (0..num_groups)
                .map(|g| (0..labels_per_group).map(|j| perm[(g * step + j) % num_labels]).collect())
                .collect()
        };
        Self::new(groups)
    }

    pub fn groups(&self) -> &[Vec<Label>] {
        &self.groups
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    /// Labels in first-appearance order across groups, without repeats
    pub fn distinct_labels(&self) -> Vec<Label> {
        let mut seen = Vec::new();
        for label in self.groups.iter().flatten() {
            if !seen.contains(label) {
                seen.push(*label);
            }
        }
        seen
    }

    /// True when some label belongs to more than one group
    pub fn has_overlap(&self) -> bool {
        self.distinct_labels().len() < self.groups.iter().map(Vec::len).sum::<usize>()
    }

    /// Every label present in `dataset_labels` must belong to some group
    pub fn validate_coverage(&self, dataset_labels: &[Label]) -> Result<()> {
        let covered = self.distinct_labels();
        let mut missing: Vec<Label> = dataset_labels
            .iter()
            .copied()
            .filter(|label| !covered.contains(label))
            .collect();
        missing.sort_unstable();
        missing.dedup();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(FedError::Config(format!(
                "labels {:?} are not covered by any cluster group",
                missing
            )))
        }
    }
}

/// How sample counts are skewed across clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SkewPolicy {
    /// Equal-size disjoint random subsets
    Iid,
    /// Label-sorted shards, two per client
    Shard { num_shards: usize },
    /// Contiguous group slices with power-law decaying client shares
    PowerLaw {
        curvature: f64,
        #[serde(default)]
        shuffle_within_group: bool,
    },
    /// Fixed number of samples per label of the client's group
    LabelCluster { samples_per_label: usize },
}

impl SkewPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            SkewPolicy::Iid => "iid",
            SkewPolicy::Shard { .. } => "shard",
            SkewPolicy::PowerLaw { .. } => "power-law",
            SkewPolicy::LabelCluster { .. } => "label-cluster",
        }
    }
}

/// Client id to ordered sample indices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMap {
    clients: Vec<Vec<usize>>,
    unassigned: Vec<usize>,
    client_groups: Vec<usize>,
}

impl PartitionMap {
    pub fn num_clients(&self) -> usize {
        self.clients.len()
    }

    /// Indices owned by `client`
    pub fn indices(&self, client: ClientId) -> &[usize] {
        &self.clients[client]
    }

    /// Indices the policy deliberately left with no client
    pub fn unassigned(&self) -> &[usize] {
        &self.unassigned
    }

    /// Label group the client was drawn from
    pub fn group_of(&self, client: ClientId) -> usize {
        self.client_groups[client]
    }

    /// First client of every group
    pub fn group_representatives(&self) -> Vec<ClientId> {
        let mut reps: Vec<ClientId> = Vec::new();
        let mut seen = Vec::new();
        for (client, &group) in self.client_groups.iter().enumerate() {
            if !seen.contains(&group) {
                seen.push(group);
                reps.push(client);
            }
        }
        reps
    }

    /// Sample counts per client
    pub fn sizes(&self) -> Vec<usize> {
        self.clients.iter().map(Vec::len).collect()
    }

    /// Total indices owned by clients
    pub fn assigned_len(&self) -> usize {
        self.clients.iter().map(Vec::len).sum()
    }

    /// Every index in `0..dataset_len` appears exactly once across clients and
    /// the unassigned pool
    pub fn validate(&self, dataset_len: usize, policy: &'static str) -> Result<()> {
        let mut seen = vec![false; dataset_len];
        let owners = self
            .clients
            .iter()
            .enumerate()
            .map(|(client, indices)| (Some(client), indices))
            .chain(std::iter::once((None, &self.unassigned)));
        for (owner, indices) in owners {
            for &idx in indices {
                let who = owner.map_or_else(|| "unassigned pool".to_string(), |c| format!("client {}", c));
                if idx >= dataset_len {
                    return Err(FedError::Partition {
                        policy,
                        reason: format!("{} holds index {} beyond dataset size {}", who, idx, dataset_len),
                    });
                }
                if seen[idx] {
                    return Err(FedError::Partition {
                        policy,
                        reason: format!("index {} is duplicated (seen again in {})", idx, who),
                    });
                }
                seen[idx] = true;
            }
        }
        let accounted = self.assigned_len() + self.unassigned.len();
        if accounted != dataset_len {
            return Err(FedError::Partition {
                policy,
                reason: format!("{} indices accounted for, dataset has {}", accounted, dataset_len),
            });
        }
        Ok(())
    }
}

/// Labels of both dataset splits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetLabels {
    pub train: Vec<Label>,
    pub test: Vec<Label>,
}

/// Train and test partitions produced from one cluster spec
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitPartition {
    pub train: PartitionMap,
    pub test: PartitionMap,
}

/// Partition both splits with independent seed streams
pub fn partition_splits(
    labels: &DatasetLabels,
    num_clients: usize,
    spec: &ClusterSpec,
    skew: &SkewPolicy,
    seed: u64,
) -> Result<SplitPartition> {
    let mut train_rng = StdRng::seed_from_u64(derive_seed(seed, 0x7472, 0));
    let mut test_rng = StdRng::seed_from_u64(derive_seed(seed, 0x7465, 1));
    Ok(SplitPartition {
        train: partition(&labels.train, num_clients, spec, skew, &mut train_rng)?,
        test: partition(&labels.test, num_clients, spec, skew, &mut test_rng)?,
    })
}

/// Assign dataset indices to clients under `skew`
pub fn partition<R: Rng + ?Sized>(
    labels: &[Label],
    num_clients: usize,
    spec: &ClusterSpec,
    skew: &SkewPolicy,
    rng: &mut R,
) -> Result<PartitionMap> {
    if num_clients == 0 {
        return Err(FedError::Config("number of clients must be positive".into()));
    }
    if num_clients > labels.len() {
        return Err(FedError::Config(format!(
            "{} clients exceed the {} available samples",
            num_clients,
            labels.len()
        )));
    }

    let map = match skew {
        SkewPolicy::Iid => partition_iid(labels.len(), num_clients, spec, rng),
        SkewPolicy::Shard { num_shards } => partition_shards(labels, num_clients, *num_shards, spec, rng)?,
        SkewPolicy::PowerLaw {
            curvature,
            shuffle_within_group,
        } => partition_power_law(labels, num_clients, spec, *curvature, *shuffle_within_group, rng)?,
        SkewPolicy::LabelCluster { samples_per_label } => {
            partition_label_cluster(labels, num_clients, spec, *samples_per_label, rng)?
        }
    };

    map.validate(labels.len(), skew.name())?;
    tracing::debug!(
        policy = skew.name(),
        clients = num_clients,
        assigned = map.assigned_len(),
        unassigned = map.unassigned().len(),
        "Partitioned dataset"
    );
    Ok(map)
}

/// Group index for each client: even split, the last group takes the rest
fn client_groups(num_clients: usize, num_groups: usize) -> Vec<usize> {
    let per_group = (num_clients / num_groups).max(1);
    (0..num_clients).map(|c| (c / per_group).min(num_groups - 1)).collect()
}

fn partition_iid<R: Rng + ?Sized>(len: usize, num_clients: usize, spec: &ClusterSpec, rng: &mut R) -> PartitionMap {
    let mut order: Vec<usize> = (0..len).collect();
    order.shuffle(rng);

    let base = len / num_clients;
    let extra = len % num_clients;
    let mut clients = Vec::with_capacity(num_clients);
    let mut start = 0;
    for c in 0..num_clients {
        let size = base + usize::from(c < extra);
        clients.push(order[start..start + size].to_vec());
        start += size;
    }

    PartitionMap {
        clients,
        unassigned: Vec::new(),
        client_groups: client_groups(num_clients, spec.num_groups()),
    }
}

fn partition_shards<R: Rng + ?Sized>(
    labels: &[Label],
    num_clients: usize,
    num_shards: usize,
    spec: &ClusterSpec,
    rng: &mut R,
) -> Result<PartitionMap> {
    if num_shards == 0 || num_shards > labels.len() {
        return Err(FedError::Config(format!(
            "{} shards cannot be cut from {} samples",
            num_shards,
            labels.len()
        )));
    }
    if num_clients * 2 > num_shards {
        return Err(FedError::Config(format!(
            "{} clients need {} shards, only {} configured",
            num_clients,
            num_clients * 2,
            num_shards
        )));
    }

    let mut order: Vec<usize> = (0..labels.len()).collect();
    order.sort_by_key(|&i| (labels[i], i));

    let shard_size = labels.len() / num_shards;
    let shard = |s: usize| {
        let end = if s + 1 == num_shards { order.len() } else { (s + 1) * shard_size };
        &order[s * shard_size..end]
    };

    let mut shard_ids: Vec<usize> = (0..num_shards).collect();
    shard_ids.shuffle(rng);

    let clients = shard_ids
        .chunks(2)
        .take(num_clients)
        .map(|pair| pair.iter().flat_map(|&s| shard(s).iter().copied()).collect())
        .collect();
    let unassigned = shard_ids[num_clients * 2..]
        .iter()
        .flat_map(|&s| shard(s).iter().copied())
        .collect();

    Ok(PartitionMap {
        clients,
        unassigned,
        client_groups: client_groups(num_clients, spec.num_groups()),
    })
}

fn partition_power_law<R: Rng + ?Sized>(
    labels: &[Label],
    num_clients: usize,
    spec: &ClusterSpec,
    curvature: f64,
    shuffle_within_group: bool,
    rng: &mut R,
) -> Result<PartitionMap> {
    let num_groups = spec.num_groups();
    if num_clients < num_groups {
        return Err(FedError::Config(format!(
            "{} clients cannot populate {} label groups",
            num_clients, num_groups
        )));
    }

    // Group-major label order; labels outside every group land in the last slice
    let rank: HashMap<Label, usize> = spec
        .distinct_labels()
        .into_iter()
        .enumerate()
        .map(|(r, label)| (label, r))
        .collect();
    let mut order: Vec<usize> = (0..labels.len()).collect();
    order.sort_by_key(|&i| (rank.get(&labels[i]).copied().unwrap_or(usize::MAX), i));

    let total = labels.len();
    let weights: Vec<usize> = spec.groups().iter().map(Vec::len).collect();
    let weight_sum: usize = weights.iter().sum();
    let mut slices: Vec<usize> = weights.iter().map(|w| total * w / weight_sum).collect();
    let sliced: usize = slices.iter().sum();
    if let Some(last) = slices.last_mut() {
        *last += total - sliced;
    }

    let groups = client_groups(num_clients, num_groups);
    let mut clients = vec![Vec::new(); num_clients];
    let mut start = 0;
    for (group, &slice_size) in slices.iter().enumerate() {
        if shuffle_within_group {
            order[start..start + slice_size].shuffle(rng);
        }
        let members: Vec<ClientId> = (0..num_clients).filter(|&c| groups[c] == group).collect();
        let counts = power_law_counts(slice_size, members.len(), curvature)?;

        let mut offset = start;
        for (&client, count) in members.iter().zip(counts) {
            clients[client] = order[offset..offset + count].to_vec();
            offset += count;
        }
        if offset != start + slice_size {
            return Err(FedError::Partition {
                policy: "power-law",
                reason: format!(
                    "group {} handed out {} of its {} samples",
                    group,
                    offset - start,
                    slice_size
                ),
            });
        }
        start += slice_size;
    }

    Ok(PartitionMap {
        clients,
        unassigned: Vec::new(),
        client_groups: groups,
    })
}

fn partition_label_cluster<R: Rng + ?Sized>(
    labels: &[Label],
    num_clients: usize,
    spec: &ClusterSpec,
    samples_per_label: usize,
    rng: &mut R,
) -> Result<PartitionMap> {
    if samples_per_label == 0 {
        return Err(FedError::Config("samples per label must be positive".into()));
    }

    let mut pools: HashMap<Label, Vec<usize>> = HashMap::new();
    for (idx, &label) in labels.iter().enumerate() {
        pools.entry(label).or_default().push(idx);
    }
    // Shuffle in label order so the draw does not depend on map iteration
    let mut pool_labels: Vec<Label> = pools.keys().copied().collect();
    pool_labels.sort_unstable();
    for label in &pool_labels {
        if let Some(pool) = pools.get_mut(label) {
            pool.shuffle(rng);
        }
    }

    let groups = client_groups(num_clients, spec.num_groups());
    let mut clients = Vec::with_capacity(num_clients);
    for (client, &group) in groups.iter().enumerate() {
        let mut indices = Vec::new();
        for label in &spec.groups()[group] {
            let pool = pools.get_mut(label).ok_or_else(|| {
                FedError::Config(format!("label {} of group {} has no samples", label, group))
            })?;
            if pool.len() < samples_per_label {
                return Err(FedError::Config(format!(
                    "label {} ran out of samples at client {} ({} left, {} needed)",
                    label,
                    client,
                    pool.len(),
                    samples_per_label
                )));
            }
            indices.extend(pool.drain(pool.len() - samples_per_label..));
        }
        clients.push(indices);
    }

    let mut unassigned = Vec::new();
    for label in &pool_labels {
        if let Some(pool) = pools.get(label) {
            unassigned.extend_from_slice(pool);
        }
    }

    Ok(PartitionMap {
        clients,
        unassigned,
        client_groups: groups,
    })
}

/// Power-law sample counts for `clients` clients sharing `slice_size` samples
///
/// `count(k) = floor(F + exp(C * x * k^2))` with `F = floor(slice_size / 2m)`
/// and `x` the root of `Σ_k (F + exp(C x k²)) = slice_size`. Counts come back
/// non-increasing and the rounding residual is added to the first client, so
/// they sum to `slice_size` exactly.
pub fn power_law_counts(slice_size: usize, clients: usize, curvature: f64) -> Result<Vec<usize>> {
    if clients == 0 {
        return Err(FedError::Config("power-law group has no clients".into()));
    }
    if curvature.is_nan() || curvature <= 0.0 || curvature.is_infinite() {
        return Err(FedError::Config(format!("power-law curvature must be positive, got {}", curvature)));
    }
    if slice_size < 2 * clients {
        return Err(FedError::Config(format!(
            "group slice of {} samples cannot feed {} clients under power-law skew",
            slice_size, clients
        )));
    }

    let floor_share = (slice_size / (2 * clients)) as f64;
    let target = slice_size as f64 - clients as f64 * floor_share;
    let x = solve_exponent(target, clients, curvature);

    let mut counts: Vec<usize> = (1..=clients)
        .map(|k| (floor_share + (curvature * x * (k * k) as f64).exp()).floor() as usize)
        .collect();
    counts.sort_unstable_by(|a, b| b.cmp(a));

    let sum: usize = counts.iter().sum();
    if sum > slice_size {
        return Err(FedError::Partition {
            policy: "power-law",
            reason: format!("counts sum to {} for a slice of {}", sum, slice_size),
        });
    }
    counts[0] += slice_size - sum;
    Ok(counts)
}

/// Root of `Σ_{k=1..m} exp(c x k²) = target` by bisection
///
/// The sum is strictly increasing in `x`. The lower bracket end is returned so
/// the floored counts never overshoot the slice.
fn solve_exponent(target: f64, clients: usize, curvature: f64) -> f64 {
    let m = clients as f64;
    let f = |x: f64| -> f64 {
        (1..=clients)
            .map(|k| (curvature * x * (k * k) as f64).exp())
            .sum::<f64>()
            - target
    };

    let mut lo = ((target / m).ln() / curvature).min(0.0);
    let mut hi = (target.ln() / curvature).max(0.0);
    if f(hi) <= 0.0 {
        return hi;
    }
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if mid <= lo || mid >= hi {
            break;
        }
        if f(mid) <= 0.0 {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    lo
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn balanced_labels(num_labels: u32, per_label: usize) -> Vec<Label> {
        (0..num_labels * per_label as u32).map(|i| i % num_labels).collect()
    }

    fn rng(seed: u64) -> StdRng {
        StdRng::seed_from_u64(seed)
    }

    #[test]
    fn test_generate_disjoint_groups() {
        let spec = ClusterSpec::generate(10, 5, 2, 0.0, &mut rng(1)).unwrap();
        assert_eq!(spec.num_groups(), 5);
        assert!(!spec.has_overlap());
        assert_eq!(spec.distinct_labels().len(), 10);
        spec.validate_coverage(&balanced_labels(10, 3)).unwrap();
    }

    #[test]
    fn test_generate_overlapping_windows() {
        // 3 labels per group sharing one with the next, wrapping like a ring
        let spec = ClusterSpec::generate(10, 5, 3, 0.34, &mut rng(2)).unwrap();
        assert!(spec.has_overlap());
        for pair in spec.groups().windows(2) {
            assert_eq!(pair[0][2], pair[1][0]);
        }
        assert_eq!(spec.groups()[4][2], spec.groups()[0][0]);
    }

    #[test]
    fn test_generate_rejects_infeasible() {
        assert!(ClusterSpec::generate(10, 6, 2, 0.0, &mut rng(0)).is_err());
        assert!(ClusterSpec::generate(10, 2, 11, 0.0, &mut rng(0)).is_err());
        assert!(ClusterSpec::generate(10, 2, 2, 1.0, &mut rng(0)).is_err());
    }

    #[test]
    fn test_coverage_reports_missing_labels() {
        let spec = ClusterSpec::new(vec![vec![0, 1], vec![2]]).unwrap();
        let err = spec.validate_coverage(&[0, 1, 2, 3, 3]).unwrap_err();
        assert!(err.to_string().contains("[3]"));
    }

    #[test]
    fn test_iid_distributes_remainder() {
        let labels = balanced_labels(10, 10);
        let spec = ClusterSpec::balanced(10, 1).unwrap();
        let map = partition(&labels, 7, &spec, &SkewPolicy::Iid, &mut rng(3)).unwrap();
        let sizes = map.sizes();
        assert_eq!(sizes.iter().sum::<usize>(), 100);
        assert!(sizes.iter().all(|&s| s == 14 || s == 15));
        assert!(map.unassigned().is_empty());
    }

    #[test]
    fn test_iid_rejects_bad_client_counts() {
        let labels = balanced_labels(2, 2);
        let spec = ClusterSpec::balanced(2, 1).unwrap();
        assert!(matches!(
            partition(&labels, 0, &spec, &SkewPolicy::Iid, &mut rng(0)),
            Err(FedError::Config(_))
        ));
        assert!(matches!(
            partition(&labels, 5, &spec, &SkewPolicy::Iid, &mut rng(0)),
            Err(FedError::Config(_))
        ));
    }

    #[test]
    fn test_shards_two_per_client() {
        let labels = balanced_labels(10, 60);
        let spec = ClusterSpec::balanced(10, 5).unwrap();
        let skew = SkewPolicy::Shard { num_shards: 20 };
        let map = partition(&labels, 8, &spec, &skew, &mut rng(4)).unwrap();
        assert!(map.sizes().iter().all(|&s| s == 60));
        assert_eq!(map.unassigned().len(), 4 * 30);

        // Label-sorted shards of 30 never straddle more than one label
        for c in 0..8 {
            let mut seen: Vec<Label> = map.indices(c).iter().map(|&i| labels[i]).collect();
            seen.dedup();
            assert!(seen.len() <= 2);
        }
    }

    #[test]
    fn test_shards_infeasible() {
        let labels = balanced_labels(10, 60);
        let spec = ClusterSpec::balanced(10, 5).unwrap();
        let err = partition(&labels, 11, &spec, &SkewPolicy::Shard { num_shards: 20 }, &mut rng(0)).unwrap_err();
        assert!(matches!(err, FedError::Config(_)));
    }

    #[test]
    fn test_power_law_counts_sum_and_decay() {
        let counts = power_law_counts(10_000, 5, 1.0).unwrap();
        assert_eq!(counts.iter().sum::<usize>(), 10_000);
        assert!(counts.windows(2).all(|w| w[0] >= w[1]));
        assert!(counts.iter().all(|&c| c >= 1_000));
    }

    #[test]
    fn test_power_law_rejects_tiny_slices() {
        assert!(power_law_counts(9, 5, 1.0).is_err());
        assert!(power_law_counts(100, 5, 0.0).is_err());
        assert_eq!(power_law_counts(10, 5, 1.0).unwrap(), vec![2, 2, 2, 2, 2]);
    }

    #[test]
    fn test_power_law_groups_own_contiguous_labels() {
        let labels = balanced_labels(10, 200);
        let spec = ClusterSpec::new(vec![vec![0, 1, 2, 3, 4], vec![5, 6, 7, 8, 9]]).unwrap();
        let skew = SkewPolicy::PowerLaw {
            curvature: 1.0,
            shuffle_within_group: true,
        };
        let map = partition(&labels, 6, &spec, &skew, &mut rng(5)).unwrap();
        assert_eq!(map.assigned_len(), labels.len());
        for c in 0..6 {
            let group = map.group_of(c);
            assert!(map.indices(c).iter().all(|&i| spec.groups()[group].contains(&labels[i])));
        }
        assert_eq!(map.group_representatives(), vec![0, 3]);
    }

    #[test]
    fn test_power_law_uneven_groups_fill_dataset() {
        let labels = balanced_labels(47, 30);
        let spec = ClusterSpec::balanced(47, 5).unwrap();
        let skew = SkewPolicy::PowerLaw {
            curvature: 1.0,
            shuffle_within_group: false,
        };
        let map = partition(&labels, 10, &spec, &skew, &mut rng(6)).unwrap();
        assert_eq!(map.assigned_len(), labels.len());
    }

    #[test]
    fn test_label_cluster_draws_group_labels() {
        let labels = balanced_labels(4, 50);
        let spec = ClusterSpec::new(vec![vec![0, 1], vec![2, 3]]).unwrap();
        let skew = SkewPolicy::LabelCluster { samples_per_label: 10 };
        let map = partition(&labels, 4, &spec, &skew, &mut rng(7)).unwrap();
        assert!(map.sizes().iter().all(|&s| s == 20));
        assert_eq!(map.unassigned().len(), 200 - 80);
        assert!(map.indices(3).iter().all(|&i| labels[i] >= 2));

        let greedy = SkewPolicy::LabelCluster { samples_per_label: 30 };
        assert!(partition(&labels, 4, &spec, &greedy, &mut rng(7)).is_err());
    }

    #[test]
    fn test_validate_catches_duplicates() {
        let map = PartitionMap {
            clients: vec![vec![0, 1], vec![1, 2]],
            unassigned: vec![],
            client_groups: vec![0, 0],
        };
        assert!(matches!(map.validate(3, "iid"), Err(FedError::Partition { .. })));

        let short = PartitionMap {
            clients: vec![vec![0], vec![1]],
            unassigned: vec![],
            client_groups: vec![0, 0],
        };
        assert!(matches!(short.validate(3, "iid"), Err(FedError::Partition { .. })));
    }

    #[test]
    fn test_splits_are_independent() {
        let labels = DatasetLabels {
            train: balanced_labels(4, 40),
            test: balanced_labels(4, 10),
        };
        let spec = ClusterSpec::balanced(4, 2).unwrap();
        let parts = partition_splits(&labels, 4, &spec, &SkewPolicy::Iid, 11).unwrap();
        assert_eq!(parts.train.assigned_len(), 160);
        assert_eq!(parts.test.assigned_len(), 40);
        let again = partition_splits(&labels, 4, &spec, &SkewPolicy::Iid, 11).unwrap();
        assert_eq!(parts, again);
    }

    proptest! {
        #[test]
        fn prop_every_policy_accounts_for_every_index(
            num_labels in 2u32..8,
            per_label in 20usize..60,
            num_clients in 2usize..6,
            seed in any::<u64>(),
        ) {
            let labels = balanced_labels(num_labels, per_label);
            let spec = ClusterSpec::balanced(num_labels as usize, 2).unwrap();
            let policies = [
                SkewPolicy::Iid,
                SkewPolicy::Shard { num_shards: num_clients * 2 + 1 },
                SkewPolicy::PowerLaw { curvature: 0.5, shuffle_within_group: true },
                SkewPolicy::LabelCluster { samples_per_label: 2 },
            ];
            for skew in &policies {
                let map = partition(&labels, num_clients, &spec, skew, &mut rng(seed)).unwrap();
                prop_assert_eq!(map.assigned_len() + map.unassigned().len(), labels.len());
            }
        }

        #[test]
        fn prop_power_law_counts_exact(slice in 20usize..50_000, clients in 1usize..10, curvature in 0.05f64..3.0) {
            prop_assume!(slice >= 2 * clients);
            let counts = power_law_counts(slice, clients, curvature).unwrap();
            prop_assert_eq!(counts.iter().sum::<usize>(), slice);
            prop_assert!(counts.windows(2).all(|w| w[0] >= w[1]));
            prop_assert!(counts.iter().all(|&c| c > 0));
        }
    }
}

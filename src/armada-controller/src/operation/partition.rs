use std::collections::HashMap;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    chunk_pool::{Key, KeySample},
    config::ControllerConfig,
    operation::spec::SortOptions,
    scheduling::{
        context::{NodeDescriptor, NodeId},
        task::{PartitionIdx, TaskIdx},
    },
};

/// Key-range slot of the shuffle. Partition `i` owns keys in
/// `[lower_key, next.lower_key)`; partition 0 has no lower bound. A maniac
/// partition consists of a single repeated key and is drained by unordered
/// merge since its rows need no sorting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partition {
    pub index: PartitionIdx,
    pub lower_key: Option<Key>,
    pub maniac: bool,
    pub completed: bool,
    /// Sticky decision of whether this partition's sorted output must pass
    /// through a final sorted merge. Made at most once, before the first
    /// sort job of the partition is handed out, and never revisited, so a
    /// job already written straight to the output table can never be
    /// followed by one that needed merging.
    pub(crate) sorted_merge_decided: bool,
    pub(crate) sorted_merge_needed: bool,
    /// Data weight routed into this partition's shuffle bucket so far.
    pub total_data_weight: i64,
    pub input_row_count: i64,
    pub output_row_count: i64,
    /// Once any job of this partition has run somewhere, the partition is
    /// pinned: reassignment would split its data across nodes.
    pub has_scheduled_jobs: bool,
    pub assigned_node: Option<NodeId>,
    pub sort_task: Option<TaskIdx>,
    pub sorted_merge_task: Option<TaskIdx>,
    pub unordered_merge_task: Option<TaskIdx>,
}

impl Partition {
    pub fn new(index: PartitionIdx, lower_key: Option<Key>, maniac: bool) -> Self {
        Self {
            index,
            lower_key,
            maniac,
            completed: false,
            sorted_merge_decided: false,
            sorted_merge_needed: false,
            total_data_weight: 0,
            input_row_count: 0,
            output_row_count: 0,
            has_scheduled_jobs: false,
            assigned_node: None,
            sort_task: None,
            sorted_merge_task: None,
            unordered_merge_task: None,
        }
    }
}

/// Boundary produced by sample selection, before partitions get tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSeed {
    pub lower_key: Option<Key>,
    pub maniac: bool,
}

fn ceil_div(a: i64, b: i64) -> i64 {
    (a + b - 1) / b
}

pub fn suggest_partition_count(
    total_data_weight: i64,
    options: &SortOptions,
    config: &ControllerConfig,
) -> usize {
    let count = match options.partition_count {
        Some(count) => count,
        None => {
            let per_partition = options
                .partition_data_weight
                .unwrap_or(config.partition_data_weight)
                .max(1);
            ceil_div(total_data_weight.max(0), per_partition) as usize
        }
    };
    count.clamp(1, config.max_partition_count)
}

/// Evenly thins an oversized sample set. Boundary selection cost scales with
/// the sample count, and a bounded number of samples per partition already
/// gives stable cuts.
pub fn thin_samples(samples: Vec<KeySample>, max_count: usize) -> Vec<KeySample> {
    if max_count == 0 || samples.len() <= max_count {
        return samples;
    }
    let len = samples.len();
    (0..max_count)
        .map(|i| samples[i * len / max_count].clone())
        .collect()
}

/// Picks partition boundaries from input key samples by walking the sorted
/// samples and cutting at even data-weight steps.
///
/// A key heavy enough to be selected as two consecutive boundaries gets
/// collapsed into its own maniac partition bounded by the key's successor,
/// unless the sample is marked incomplete (the sampled key is a prefix of
/// the real keys, so equal samples may stand for distinct full keys and the
/// partition merely stays oversized).
pub fn select_partition_seeds(samples: &[KeySample], partition_count: usize) -> Vec<PartitionSeed> {
    let first = PartitionSeed {
        lower_key: None,
        maniac: false,
    };
    if partition_count <= 1 || samples.is_empty() {
        return vec![first];
    }

    let sorted: Vec<&KeySample> = samples.iter().sorted_by(|a, b| a.key.cmp(&b.key)).collect();
    let total_weight: i64 = sorted.iter().map(|s| s.weight).sum();
    let step = (total_weight / partition_count as i64).max(1);

    enum Cut {
        New,
        Maniac,
        Skip,
    }

    let mut seeds = vec![first];
    let mut accumulated = 0i64;
    let mut next_cut = step;
    for sample in &sorted {
        accumulated += sample.weight;
        while accumulated >= next_cut && seeds.len() < partition_count {
            next_cut += step;
            let cut = match seeds.last().and_then(|s| s.lower_key.as_ref()) {
                Some(boundary) if *boundary == sample.key => {
                    if sample.incomplete {
                        Cut::Skip
                    } else {
                        Cut::Maniac
                    }
                }
                // Already cut past this key (successor boundary of a
                // maniac run).
                Some(boundary) if *boundary > sample.key => Cut::Skip,
                _ => Cut::New,
            };
            match cut {
                Cut::Skip => {}
                Cut::Maniac => {
                    if let Some(last) = seeds.last_mut() {
                        if !last.maniac {
                            last.maniac = true;
                            seeds.push(PartitionSeed {
                                lower_key: Some(sample.key.successor()),
                                maniac: false,
                            });
                        }
                    }
                }
                Cut::New => seeds.push(PartitionSeed {
                    lower_key: Some(sample.key.clone()),
                    maniac: false,
                }),
            }
        }
    }
    seeds
}

/// Greedily assigns unpinned partitions to nodes, heaviest first, always
/// onto the node whose projected relative load is lowest. Partitions that
/// already scheduled jobs keep their node.
pub fn assign_partitions(partitions: &mut [Partition], nodes: &[NodeDescriptor]) {
    if nodes.is_empty() {
        return;
    }
    let capacity: HashMap<NodeId, f64> = nodes
        .iter()
        .map(|n| {
            let slots = n.resource_limits.user_slots.max(1) as f64;
            (n.id, (n.io_weight * slots).max(f64::MIN_POSITIVE))
        })
        .collect();
    let mut load: HashMap<NodeId, i64> = nodes.iter().map(|n| (n.id, 0)).collect();
    for partition in partitions.iter() {
        if partition.has_scheduled_jobs {
            if let Some(node) = partition.assigned_node {
                *load.entry(node).or_insert(0) += partition.total_data_weight;
            }
        }
    }

    let mut order: Vec<usize> = (0..partitions.len())
        .filter(|&i| !partitions[i].has_scheduled_jobs)
        .collect();
    order.sort_by_key(|&i| std::cmp::Reverse(partitions[i].total_data_weight));

    for index in order {
        let weight = partitions[index].total_data_weight;
        let best = nodes.iter().min_by(|a, b| {
            let ratio = |n: &NodeDescriptor| (load[&n.id] + weight) as f64 / capacity[&n.id];
            ratio(a).total_cmp(&ratio(b))
        });
        if let Some(node) = best {
            partitions[index].assigned_node = Some(node.id);
            *load.entry(node.id).or_insert(0) += weight;
        }
    }
}

#[cfg(test)]
mod tests {
    use common_resource_request::ResourceRequest;

    use super::*;

    fn sample(key: i64, weight: i64) -> KeySample {
        KeySample::new(Key::from_i64(&[key]), weight)
    }

    #[test]
    fn seeds_cut_at_even_weight_steps() {
        let samples: Vec<KeySample> = (0..100).map(|k| sample(k, 1)).collect();
        let seeds = select_partition_seeds(&samples, 4);
        assert_eq!(seeds.len(), 4);
        assert_eq!(seeds[0].lower_key, None);
        assert!(seeds.iter().all(|s| !s.maniac));
        // Boundaries are strictly increasing.
        for pair in seeds.windows(2) {
            if let (Some(a), Some(b)) = (&pair[0].lower_key, &pair[1].lower_key) {
                assert!(a < b);
            }
        }
    }

    #[test]
    fn heavy_repeated_key_collapses_into_maniac_partition() {
        // One key carries most of the weight, spanning several cut points.
        let mut samples: Vec<KeySample> = (0..10).map(|k| sample(k, 1)).collect();
        samples.push(sample(5, 1000));
        let seeds = select_partition_seeds(&samples, 5);

        let maniac: Vec<&PartitionSeed> = seeds.iter().filter(|s| s.maniac).collect();
        assert_eq!(maniac.len(), 1);
        assert_eq!(maniac[0].lower_key, Some(Key::from_i64(&[5])));
        // The partition after the maniac run starts at the key's successor.
        let maniac_pos = seeds.iter().position(|s| s.maniac).unwrap();
        assert_eq!(
            seeds[maniac_pos + 1].lower_key,
            Some(Key::from_i64(&[5]).successor())
        );
    }

    #[test]
    fn incomplete_samples_never_collapse() {
        let mut samples: Vec<KeySample> = (0..10).map(|k| sample(k, 1)).collect();
        samples.push(KeySample::new(Key::from_i64(&[5]), 1000).incomplete());
        let seeds = select_partition_seeds(&samples, 5);
        assert!(seeds.iter().all(|s| !s.maniac));
    }

    #[test]
    fn random_samples_yield_strictly_increasing_boundaries() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(17);
        for _ in 0..20 {
            let samples: Vec<KeySample> = (0..200)
                .map(|_| sample(rng.gen_range(0..50), rng.gen_range(1..100)))
                .collect();
            let count = rng.gen_range(1..10);
            let seeds = select_partition_seeds(&samples, count);
            assert!(!seeds.is_empty());
            assert!(seeds.len() <= count);
            assert_eq!(seeds[0].lower_key, None);
            for pair in seeds.windows(2) {
                match (&pair[0].lower_key, &pair[1].lower_key) {
                    (None, Some(_)) => {}
                    (Some(a), Some(b)) => assert!(a < b),
                    _ => panic!("later seed lost its boundary"),
                }
            }
        }
    }

    #[test]
    fn oversized_sample_sets_are_thinned_evenly() {
        let samples: Vec<KeySample> = (0..100).map(|k| sample(k, 1)).collect();
        let thinned = thin_samples(samples.clone(), 10);
        assert_eq!(thinned.len(), 10);
        assert_eq!(thinned[0].key, Key::from_i64(&[0]));
        assert_eq!(thinned[9].key, Key::from_i64(&[90]));
        // Small sets pass through untouched.
        assert_eq!(thin_samples(samples[..5].to_vec(), 10).len(), 5);
    }

    #[test]
    fn suggested_count_honors_explicit_and_clamps() {
        let config = ControllerConfig {
            max_partition_count: 100,
            ..Default::default()
        };
        let explicit = SortOptions::new(vec!["k".into()]).with_partition_count(7);
        assert_eq!(suggest_partition_count(1 << 40, &explicit, &config), 7);

        let mut derived = SortOptions::new(vec!["k".into()]);
        derived.partition_data_weight = Some(1);
        assert_eq!(suggest_partition_count(1 << 40, &derived, &config), 100);
    }

    #[test]
    fn assignment_spreads_load_and_keeps_pinned_partitions() {
        let nodes = vec![
            NodeDescriptor::new(1, "n1:9012", ResourceRequest::from_memory(1 << 30)),
            NodeDescriptor::new(2, "n2:9012", ResourceRequest::from_memory(1 << 30)),
        ];
        let mut partitions: Vec<Partition> = (0..4)
            .map(|i| {
                let mut p = Partition::new(i, None, false);
                p.total_data_weight = 100;
                p
            })
            .collect();
        partitions[3].has_scheduled_jobs = true;
        partitions[3].assigned_node = Some(2);

        assign_partitions(&mut partitions, &nodes);

        assert_eq!(partitions[3].assigned_node, Some(2));
        let on_node_1 = partitions.iter().filter(|p| p.assigned_node == Some(1)).count();
        let on_node_2 = partitions.iter().filter(|p| p.assigned_node == Some(2)).count();
        assert_eq!(on_node_1, 2);
        assert_eq!(on_node_2, 2);
    }
}

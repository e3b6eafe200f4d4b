use std::{
    collections::HashMap,
    fmt::{self, Display},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scheduling::context::NodeId;

/// One component of a row key. Variant order defines the comparison order;
/// `Min` and `Max` are sentinels used for boundary construction and never
/// appear in real row data.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyPart {
    Min,
    Null,
    Int64(i64),
    Uint64(u64),
    String(String),
    Max,
}

/// A row key: a tuple of parts compared lexicographically. A proper prefix
/// compares below any of its extensions.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Key(pub Vec<KeyPart>);

impl Key {
    pub fn from_parts(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }

    /// Convenience constructor for integer keys.
    pub fn from_i64(values: &[i64]) -> Self {
        Self(values.iter().copied().map(KeyPart::Int64).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The smallest representable key strictly greater than `self`: the key
    /// extended with a minimal sentinel part. Rows equal to `self` stay
    /// below the successor; any key with a strictly greater part lands
    /// above it. Used as the upper bound of a maniac partition.
    #[must_use]
    pub fn successor(&self) -> Self {
        let mut parts = self.0.clone();
        parts.push(KeyPart::Min);
        Self(parts)
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match part {
                KeyPart::Min => write!(f, "<min>")?,
                KeyPart::Null => write!(f, "null")?,
                KeyPart::Int64(v) => write!(f, "{v}")?,
                KeyPart::Uint64(v) => write!(f, "{v}u")?,
                KeyPart::String(v) => write!(f, "{v:?}")?,
                KeyPart::Max => write!(f, "<max>")?,
            }
        }
        write!(f, "]")
    }
}

/// A weighted key sample fetched from the input tables. `incomplete` marks
/// samples truncated during fetching, whose key is a prefix of the real row
/// key and therefore ambiguous for equality decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeySample {
    pub key: Key,
    pub weight: i64,
    pub incomplete: bool,
}

impl KeySample {
    pub fn new(key: Key, weight: i64) -> Self {
        Self {
            key,
            weight,
            incomplete: false,
        }
    }

    #[must_use]
    pub fn incomplete(mut self) -> Self {
        self.incomplete = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(Uuid);

impl ChunkId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A byte/row sub-range of one chunk, the unit a chunk pool slices and
/// groups into jobs. The chunk itself is owned by the storage layer; the
/// controller only tracks sizes, keys and replica placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSlice {
    pub chunk_id: ChunkId,
    pub table_index: usize,
    pub data_weight: i64,
    pub row_count: i64,
    pub lower_key: Option<Key>,
    pub upper_key: Option<Key>,
    /// For shuffle-bound slices: the partition this slice was written for.
    pub partition_tag: Option<usize>,
    /// Nodes holding a replica of the chunk, for locality-aware extraction.
    pub replica_nodes: Vec<NodeId>,
}

impl ChunkSlice {
    pub fn new(chunk_id: ChunkId, data_weight: i64, row_count: i64) -> Self {
        Self {
            chunk_id,
            table_index: 0,
            data_weight,
            row_count,
            lower_key: None,
            upper_key: None,
            partition_tag: None,
            replica_nodes: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_keys(mut self, lower: Key, upper: Key) -> Self {
        self.lower_key = Some(lower);
        self.upper_key = Some(upper);
        self
    }

    #[must_use]
    pub fn with_partition_tag(mut self, tag: usize) -> Self {
        self.partition_tag = Some(tag);
        self
    }

    #[must_use]
    pub fn with_replicas(mut self, nodes: Vec<NodeId>) -> Self {
        self.replica_nodes = nodes;
        self
    }

    #[must_use]
    pub fn with_table_index(mut self, table_index: usize) -> Self {
        self.table_index = table_index;
        self
    }
}

/// A bag of chunk slices delivered together to one job. Owned by exactly one
/// chunk pool at a time and addressed there by an input cookie.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkStripe {
    pub slices: Vec<ChunkSlice>,
}

impl ChunkStripe {
    pub fn new(slices: Vec<ChunkSlice>) -> Self {
        Self { slices }
    }

    pub fn push(&mut self, slice: ChunkSlice) {
        self.slices.push(slice);
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub fn data_weight(&self) -> i64 {
        self.slices.iter().map(|s| s.data_weight).sum()
    }

    pub fn row_count(&self) -> i64 {
        self.slices.iter().map(|s| s.row_count).sum()
    }

    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }

    pub fn chunk_ids(&self) -> impl Iterator<Item = ChunkId> + '_ {
        self.slices.iter().map(|s| s.chunk_id)
    }

    pub fn contains_chunk(&self, chunk_id: ChunkId) -> bool {
        self.slices.iter().any(|s| s.chunk_id == chunk_id)
    }

    /// Per-node data weight of the stripe, counting each slice once per
    /// replica node.
    pub fn locality(&self) -> HashMap<NodeId, i64> {
        let mut map = HashMap::new();
        for slice in &self.slices {
            for node in &slice.replica_nodes {
                *map.entry(*node).or_insert(0) += slice.data_weight;
            }
        }
        map
    }

    /// A copy of the stripe with every slice of `chunk_id` removed. Used by
    /// the skip strategy for permanently unavailable input chunks.
    #[must_use]
    pub fn without_chunk(&self, chunk_id: ChunkId) -> Self {
        Self {
            slices: self
                .slices
                .iter()
                .filter(|s| s.chunk_id != chunk_id)
                .cloned()
                .collect(),
        }
    }
}

/// The stripes handed to one job, with precomputed totals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StripeList {
    pub stripes: Vec<ChunkStripe>,
    pub total_data_weight: i64,
    pub total_row_count: i64,
}

impl StripeList {
    pub fn push(&mut self, stripe: ChunkStripe) {
        self.total_data_weight += stripe.data_weight();
        self.total_row_count += stripe.row_count();
        self.stripes.push(stripe);
    }

    pub fn slice_count(&self) -> usize {
        self.stripes.iter().map(ChunkStripe::slice_count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.stripes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ordering_is_lexicographic() {
        let a = Key::from_i64(&[1, 2]);
        let b = Key::from_i64(&[1, 3]);
        let prefix = Key::from_i64(&[1]);
        assert!(a < b);
        assert!(prefix < a);
        assert!(Key::from_parts(vec![KeyPart::Null]) < Key::from_parts(vec![KeyPart::Int64(0)]));
    }

    #[test]
    fn successor_sits_between_key_and_extensions() {
        let key = Key::from_i64(&[5]);
        let succ = key.successor();
        assert!(key < succ);
        assert!(succ < Key::from_i64(&[5, 0]));
        assert!(succ < Key::from_i64(&[6]));
    }

    #[test]
    fn stripe_totals_and_locality() {
        let mut stripe = ChunkStripe::default();
        stripe.push(ChunkSlice::new(ChunkId::new(), 100, 10).with_replicas(vec![1, 2]));
        stripe.push(ChunkSlice::new(ChunkId::new(), 50, 5).with_replicas(vec![2]));
        assert_eq!(stripe.data_weight(), 150);
        assert_eq!(stripe.row_count(), 15);
        let locality = stripe.locality();
        assert_eq!(locality[&1], 100);
        assert_eq!(locality[&2], 150);
    }

    #[test]
    fn without_chunk_drops_all_slices_of_the_chunk() {
        let victim = ChunkId::new();
        let stripe = ChunkStripe::new(vec![
            ChunkSlice::new(victim, 10, 1),
            ChunkSlice::new(ChunkId::new(), 20, 2),
            ChunkSlice::new(victim, 30, 3),
        ]);
        let patched = stripe.without_chunk(victim);
        assert_eq!(patched.slice_count(), 1);
        assert_eq!(patched.data_weight(), 20);
    }
}

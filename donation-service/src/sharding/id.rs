use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Low bits of an [`EntityId`] hold the per-partition sequence; the 16 bits
/// above them hold the partition that generated it. Bit 63 stays clear.
const SEQUENCE_BITS: u32 = 47;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;

/// Physical storage partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(pub u16);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Store-assigned identifier that remembers which partition generated it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EntityId(i64);

impl EntityId {
    /// Placeholder carried by entities that have not been persisted yet.
    pub const UNASSIGNED: EntityId = EntityId(0);

    /// Build an id from a partition and a sequence value (1-based).
    /// Returns `None` when the sequence no longer fits.
    pub fn compose(partition: PartitionId, sequence: u64) -> Option<Self> {
        if sequence == 0 || sequence > SEQUENCE_MASK as u64 {
            return None;
        }
        Some(Self(((partition.0 as i64) << SEQUENCE_BITS) | sequence as i64))
    }

    pub fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }

    pub fn partition(self) -> PartitionId {
        PartitionId((self.0 >> SEQUENCE_BITS) as u16)
    }

    pub fn sequence(self) -> u64 {
        (self.0 & SEQUENCE_MASK) as u64
    }

    pub fn is_assigned(self) -> bool {
        self.0 > 0 && self.sequence() > 0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(Self)
    }
}

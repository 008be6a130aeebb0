use crate::serialization::{Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt::Formatter;

/// Identifies one simulated endpoint's home: the OS process (rank) and the worker thread within it.
///
/// Addresses are created once per endpoint when the simulation is partitioned and never change afterwards. A
/// default-constructed address is "unassigned": both fields hold [`UNASSIGNED`]. Assigned addresses have both fields
/// set to real values; there is no half-assigned state.
///
/// Ordering is lexicographic, rank first and then thread, so `(1, 0) < (1, 1) < (2, 0)`.
///
/// [`UNASSIGNED`]: RankAddress::UNASSIGNED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RankAddress {
    pub rank: u32,
    pub thread: u32,
}

impl RankAddress {
    /// Sentinel stored in both fields of an unassigned address.
    pub const UNASSIGNED: u32 = u32::MAX;

    /// Construct an address for the given rank and thread.
    pub const fn new(rank: u32, thread: u32) -> Self {
        Self { rank, thread }
    }

    /// Construct the unassigned sentinel address.
    pub const fn unassigned() -> Self {
        Self::new(Self::UNASSIGNED, Self::UNASSIGNED)
    }

    /// Whether both fields carry real values.
    pub fn is_assigned(&self) -> bool {
        self.rank != Self::UNASSIGNED && self.thread != Self::UNASSIGNED
    }

    /// Reports whether `other` lies entirely below `self` in the (rank, thread) lattice, i.e. `self.rank > other.rank`
    /// AND `self.thread > other.thread`.
    ///
    /// This is a conjunction of strict inequalities, not [`Ord`] and not a component-wise partial order: an address
    /// that is greater in only one coordinate is not "in range".
    pub fn in_range(&self, other: &RankAddress) -> bool {
        self.rank > other.rank && self.thread > other.thread
    }
}

impl Default for RankAddress {
    fn default() -> Self {
        Self::unassigned()
    }
}

impl PartialOrd for RankAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RankAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.rank.cmp(&other.rank) {
            Ordering::Equal => self.thread.cmp(&other.thread),
            comparison => comparison,
        }
    }
}

impl std::fmt::Display for RankAddress {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        if self.is_assigned() {
            write!(f, "{}:{}", self.rank, self.thread)
        } else {
            write!(f, "unassigned")
        }
    }
}

impl Serialize for RankAddress {
    fn serialize_order(&mut self, ser: &mut Serializer<'_>) -> crate::Result {
        self.rank.serialize_order(ser)?;
        self.thread.serialize_order(ser)
    }
}

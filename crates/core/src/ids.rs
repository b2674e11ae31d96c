use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of one participating process in the distributed computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RankId(pub u32);

impl fmt::Display for RankId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rank-{}", self.0)
    }
}

impl From<u32> for RankId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

/// Local handle of a fragment cache slot. Never reused within one cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(pub u64);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// A contiguous span of point indices `[begin, begin + count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PointRange {
    pub begin: usize,
    pub count: usize,
}

impl PointRange {
    pub fn new(begin: usize, count: usize) -> Self {
        Self { begin, count }
    }

    /// One past the last index. Saturates at `usize::MAX`; use
    /// [`checked_end`](Self::checked_end) on untrusted spans.
    pub fn end(&self) -> usize {
        self.begin.saturating_add(self.count)
    }

    pub fn checked_end(&self) -> Option<usize> {
        self.begin.checked_add(self.count)
    }

    pub fn contains(&self, point: usize) -> bool {
        point >= self.begin && point < self.end()
    }

    /// Whether `other` lies entirely inside this range.
    pub fn covers(&self, other: &PointRange) -> bool {
        other.begin >= self.begin && other.end() <= self.end()
    }
}

/// Names a subtree span: `(owning rank, start offset, count)`.
///
/// Two fragments with equal identity are the same logical object no matter
/// how many local handles point at it. Ordering is lexicographic on the
/// triple, which makes it usable as an ordered map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FragmentIdentity {
    pub rank: RankId,
    pub begin: usize,
    pub count: usize,
}

impl FragmentIdentity {
    pub fn new(rank: RankId, begin: usize, count: usize) -> Self {
        Self { rank, begin, count }
    }

    /// Number of points the fragment spans; this is what budgets charge.
    pub fn point_count(&self) -> u64 {
        self.count as u64
    }

    pub fn span(&self) -> PointRange {
        PointRange::new(self.begin, self.count)
    }
}

impl fmt::Display for FragmentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} {} {})", self.rank.0, self.begin, self.count)
    }
}

//! Sub-tree fragments: handles onto a span of a tree plus the data under it.

use std::sync::Arc;

use canopy_core::{FragmentIdentity, PointRange};

use crate::error::TableError;
use crate::table::{NodeIndex, PointTable, TreeNode};

/// Who is responsible for the storage behind a fragment.
///
/// A `Borrowed` handle aliases a table that belongs to someone else (the
/// rank's own dataset, or a fragment already sitting in a cache); dropping it
/// never releases that storage. An `Owned` handle was materialized from a
/// donation and is the authoritative copy of its rows on this rank.
#[derive(Debug, Clone)]
pub enum Backing {
    Borrowed(Arc<PointTable>),
    Owned(Arc<PointTable>),
}

impl Backing {
    pub fn table(&self) -> &Arc<PointTable> {
        match self {
            Backing::Borrowed(table) | Backing::Owned(table) => table,
        }
    }
}

/// A subtree rooted at `root` together with the point ranges for which rows
/// are actually present.
///
/// The tree shape always covers the whole root span; the materialized ranges
/// may cover less than that, which is what distinguishes a structure-only
/// alias from a fully materialized copy.
#[derive(Debug, Clone)]
pub struct SubTreeFragment {
    backing: Backing,
    root: NodeIndex,
    span: PointRange,
    ranges: Vec<PointRange>,
}

impl SubTreeFragment {
    /// Alias the subtree under `root` of a table owned elsewhere, with every
    /// point of the root span materialized.
    pub fn borrowed(table: Arc<PointTable>, root: NodeIndex) -> Result<Self, TableError> {
        let span = table.node(root).ok_or(TableError::UnknownNode(root))?.span();
        let fragment = Self {
            backing: Backing::Borrowed(table),
            root,
            span,
            ranges: vec![span],
        };
        fragment.check_materialized()?;
        Ok(fragment)
    }

    /// Wrap a table reconstructed from the wire. The root is node 0 and the
    /// materialized ranges are exactly the table's rows.
    pub(crate) fn owned(table: PointTable) -> Result<Self, TableError> {
        let span = table.node(0).ok_or(TableError::UnknownNode(0))?.span();
        let ranges = table.block().ranges().to_vec();
        Ok(Self {
            backing: Backing::Owned(Arc::new(table)),
            root: 0,
            span,
            ranges,
        })
    }

    /// Narrow the materialized ranges, keeping the tree shape.
    pub fn with_ranges(mut self, ranges: Vec<PointRange>) -> Result<Self, TableError> {
        let span = self.span;
        if ranges.iter().any(|r| !span.covers(r)) {
            return Err(TableError::InvalidRanges(ranges));
        }
        self.ranges = ranges;
        self.check_materialized()?;
        Ok(self)
    }

    fn check_materialized(&self) -> Result<(), TableError> {
        let block = self.table().block();
        let mut last_end = None;
        for range in &self.ranges {
            if range.count == 0 || last_end.is_some_and(|end| range.begin < end) {
                return Err(TableError::InvalidRanges(self.ranges.clone()));
            }
            last_end = Some(range.end());
            if !block.materializes(range) {
                return Err(TableError::NotMaterialized(range.begin));
            }
        }
        Ok(())
    }

    /// A borrowed handle onto the same storage and ranges.
    pub fn alias(&self) -> Self {
        Self {
            backing: Backing::Borrowed(Arc::clone(self.backing.table())),
            root: self.root,
            span: self.span,
            ranges: self.ranges.clone(),
        }
    }

    pub fn identity(&self) -> FragmentIdentity {
        FragmentIdentity::new(self.table().rank(), self.span.begin, self.span.count)
    }

    /// Points spanned by the root, which is what admission budgets charge.
    pub fn point_count(&self) -> u64 {
        self.span.count as u64
    }

    /// Points whose rows are present.
    pub fn materialized_points(&self) -> usize {
        self.ranges.iter().map(|r| r.count).sum()
    }

    pub fn is_borrowed(&self) -> bool {
        matches!(self.backing, Backing::Borrowed(_))
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    pub fn table(&self) -> &PointTable {
        self.backing.table()
    }

    pub fn root(&self) -> NodeIndex {
        self.root
    }

    pub fn root_node(&self) -> Option<&TreeNode> {
        self.table().node(self.root)
    }

    /// Point span of the root node.
    pub fn span(&self) -> PointRange {
        self.span
    }

    pub fn ranges(&self) -> &[PointRange] {
        &self.ranges
    }

    /// Pre-order `(begin, count, parent position)` triples of the subtree.
    pub fn shape(&self) -> Vec<(usize, usize, Option<usize>)> {
        let tree = self.table().tree();
        tree.preorder(self.root)
            .into_iter()
            .filter_map(|(index, parent)| {
                tree.get(index).map(|n| (n.begin, n.count, parent))
            })
            .collect()
    }

    /// Row data of `point`, if materialized in this fragment.
    pub fn point(&self, point: usize) -> Option<&[f64]> {
        if !self.ranges.iter().any(|r| r.contains(point)) {
            return None;
        }
        self.table().block().point(point)
    }
}

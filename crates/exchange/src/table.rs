//! Point tables and the tree arenas built over them.
//!
//! This is the storage surface the exchange layer relies on: a block of rows
//! covering one or more materialized point ranges, the index permutations
//! produced by tree construction, and the node arena itself. A table built
//! locally materializes every point; a table reconstructed from a donation
//! holds only the rows of the ranges that were shipped, stored contiguously.

use serde::{Deserialize, Serialize};

use canopy_core::{PointRange, RankId};

use crate::error::TableError;

/// Position of a node inside a [`TreeArena`].
pub type NodeIndex = usize;

/// One node of a binary space-partitioning tree over `[begin, begin + count)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub begin: usize,
    pub count: usize,
    pub left: Option<NodeIndex>,
    pub right: Option<NodeIndex>,
}

impl TreeNode {
    pub fn leaf(begin: usize, count: usize) -> Self {
        Self {
            begin,
            count,
            left: None,
            right: None,
        }
    }

    pub fn span(&self) -> PointRange {
        PointRange::new(self.begin, self.count)
    }

    pub fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }
}

/// Flat storage for tree nodes; children are referenced by index.
#[derive(Debug, Clone, Default)]
pub struct TreeArena {
    nodes: Vec<TreeNode>,
}

impl TreeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, index: NodeIndex) -> Option<&TreeNode> {
        self.nodes.get(index)
    }

    pub fn push(&mut self, node: TreeNode) -> NodeIndex {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Attach `child` under `parent`. A child starting where its parent starts
    /// becomes the left child, any other child the right one.
    pub fn attach(&mut self, parent: NodeIndex, child: NodeIndex) -> Result<(), TableError> {
        let child_span = self.get(child).ok_or(TableError::UnknownNode(child))?.span();
        let parent_node = self
            .nodes
            .get_mut(parent)
            .ok_or(TableError::UnknownNode(parent))?;

        let overflows =
            child_span.checked_end().is_none() || parent_node.span().checked_end().is_none();
        if overflows
            || !parent_node.span().covers(&child_span)
            || child_span.count == parent_node.count
        {
            return Err(TableError::ChildOutsideParent { parent, child });
        }

        let slot = if child_span.begin == parent_node.begin {
            &mut parent_node.left
        } else {
            &mut parent_node.right
        };
        if slot.is_some() {
            return Err(TableError::ChildSlotTaken { parent, child });
        }
        *slot = Some(child);
        Ok(())
    }

    /// Pre-order walk from `root`, left before right. Each entry pairs a node
    /// with the position of its parent inside the returned list.
    pub fn preorder(&self, root: NodeIndex) -> Vec<(NodeIndex, Option<usize>)> {
        let mut order = Vec::new();
        let mut stack = vec![(root, None)];
        while let Some((index, parent)) = stack.pop() {
            let Some(node) = self.nodes.get(index) else {
                continue;
            };
            let position = order.len();
            order.push((index, parent));
            if let Some(right) = node.right {
                stack.push((right, Some(position)));
            }
            if let Some(left) = node.left {
                stack.push((left, Some(position)));
            }
        }
        order
    }
}

/// Rows, weights and permutation entries for a set of materialized ranges.
///
/// Rows are laid out contiguously in range order, so the row of a point is
/// its offset inside its range plus the sizes of all earlier ranges.
#[derive(Debug, Clone, PartialEq)]
pub struct PointBlock {
    dims: usize,
    weight_dims: usize,
    ranges: Vec<PointRange>,
    data: Vec<f64>,
    weights: Vec<f64>,
    old_from_new: Vec<usize>,
    new_from_old: Option<Vec<usize>>,
}

impl PointBlock {
    pub fn new(
        dims: usize,
        weight_dims: usize,
        ranges: Vec<PointRange>,
        data: Vec<f64>,
        weights: Vec<f64>,
        old_from_new: Vec<usize>,
        new_from_old: Option<Vec<usize>>,
    ) -> Result<Self, TableError> {
        validate_ranges(&ranges)?;
        let points = ranges
            .iter()
            .try_fold(0usize, |total, r| total.checked_add(r.count))
            .ok_or_else(|| TableError::Shape("point count overflows".into()))?;

        if dims == 0 {
            return Err(TableError::Shape("point dimensionality must be positive".into()));
        }
        let values = dims
            .checked_mul(points)
            .ok_or_else(|| TableError::Shape(format!("{points} points of {dims} dims overflow")))?;
        if data.len() != values {
            return Err(TableError::Shape(format!(
                "expected {values} data values for {points} points of {dims} dims, got {}",
                data.len()
            )));
        }
        let weight_values = weight_dims.checked_mul(points).ok_or_else(|| {
            TableError::Shape(format!("{points} points of {weight_dims} weights overflow"))
        })?;
        if weights.len() != weight_values {
            return Err(TableError::Shape(format!(
                "expected {weight_values} weight values, got {}",
                weights.len()
            )));
        }
        if old_from_new.len() != points {
            return Err(TableError::Shape(format!(
                "old-from-new permutation has {} entries for {points} points",
                old_from_new.len()
            )));
        }
        if let Some(reverse) = &new_from_old {
            if reverse.len() != points {
                return Err(TableError::Shape(format!(
                    "new-from-old permutation has {} entries for {points} points",
                    reverse.len()
                )));
            }
        }

        Ok(Self {
            dims,
            weight_dims,
            ranges,
            data,
            weights,
            old_from_new,
            new_from_old,
        })
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn weight_dims(&self) -> usize {
        self.weight_dims
    }

    pub fn ranges(&self) -> &[PointRange] {
        &self.ranges
    }

    /// Number of materialized points.
    pub fn len(&self) -> usize {
        self.old_from_new.len()
    }

    pub fn is_empty(&self) -> bool {
        self.old_from_new.is_empty()
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn old_from_new(&self) -> &[usize] {
        &self.old_from_new
    }

    pub fn new_from_old(&self) -> Option<&[usize]> {
        self.new_from_old.as_deref()
    }

    /// Row holding `point`, if that point is materialized here.
    pub fn row_of(&self, point: usize) -> Option<usize> {
        let mut offset = 0;
        for range in &self.ranges {
            if range.contains(point) {
                return Some(offset + point - range.begin);
            }
            offset += range.count;
        }
        None
    }

    /// Whether every point of `range` has a row here.
    pub fn materializes(&self, range: &PointRange) -> bool {
        let present: usize = self
            .ranges
            .iter()
            .map(|r| r.end().min(range.end()).saturating_sub(r.begin.max(range.begin)))
            .sum();
        present == range.count
    }

    pub fn point(&self, point: usize) -> Option<&[f64]> {
        let row = self.row_of(point)?;
        self.data.get(row * self.dims..(row + 1) * self.dims)
    }

    pub fn weight(&self, point: usize) -> Option<&[f64]> {
        let row = self.row_of(point)?;
        self.weights
            .get(row * self.weight_dims..(row + 1) * self.weight_dims)
    }

    /// Index the point had in the dataset before tree construction reordered it.
    pub fn old_index(&self, point: usize) -> Option<usize> {
        self.row_of(point).map(|row| self.old_from_new[row])
    }

    /// Copy out the rows of `ranges` into a compact block of their own.
    pub fn restrict(
        &self,
        ranges: &[PointRange],
        include_reverse: bool,
    ) -> Result<PointBlock, TableError> {
        let points: usize = ranges.iter().map(|r| r.count).sum();
        let mut data = Vec::with_capacity(points * self.dims);
        let mut weights = Vec::with_capacity(points * self.weight_dims);
        let mut old_from_new = Vec::with_capacity(points);
        let reverse_source = self.new_from_old.as_ref().filter(|_| include_reverse);
        let mut new_from_old = reverse_source.map(|_| Vec::with_capacity(points));

        for range in ranges {
            for point in range.begin..range.end() {
                let row = self.row_of(point).ok_or(TableError::NotMaterialized(point))?;
                data.extend_from_slice(&self.data[row * self.dims..(row + 1) * self.dims]);
                weights.extend_from_slice(
                    &self.weights[row * self.weight_dims..(row + 1) * self.weight_dims],
                );
                old_from_new.push(self.old_from_new[row]);
                if let (Some(out), Some(src)) = (new_from_old.as_mut(), reverse_source) {
                    out.push(src[row]);
                }
            }
        }

        PointBlock::new(
            self.dims,
            self.weight_dims,
            ranges.to_vec(),
            data,
            weights,
            old_from_new,
            new_from_old,
        )
    }

    /// Full copy, optionally dropping the reverse permutation.
    pub fn duplicate(&self, include_reverse: bool) -> PointBlock {
        let mut copy = self.clone();
        if !include_reverse {
            copy.new_from_old = None;
        }
        copy
    }
}

fn validate_ranges(ranges: &[PointRange]) -> Result<(), TableError> {
    let mut last_end = None;
    for range in ranges {
        let end = range.checked_end();
        if range.count == 0 || end.is_none() || last_end.is_some_and(|last| range.begin < last) {
            return Err(TableError::InvalidRanges(ranges.to_vec()));
        }
        last_end = end;
    }
    Ok(())
}

/// A (possibly partial) point set owned by one rank, with its tree.
#[derive(Debug, Clone)]
pub struct PointTable {
    rank: RankId,
    block: PointBlock,
    tree: TreeArena,
}

impl PointTable {
    pub fn from_parts(rank: RankId, block: PointBlock, tree: TreeArena) -> Self {
        Self { rank, block, tree }
    }

    /// Build a table over row-major `points`, splitting nodes at the median of
    /// their widest dimension until they hold at most `leaf_size` points.
    pub fn build(
        rank: RankId,
        dims: usize,
        points: Vec<f64>,
        weight_dims: usize,
        weights: Vec<f64>,
        leaf_size: usize,
    ) -> Result<Self, TableError> {
        if dims == 0 || points.is_empty() || points.len() % dims != 0 {
            return Err(TableError::Shape(format!(
                "{} values cannot form points of {dims} dims",
                points.len()
            )));
        }
        let n = points.len() / dims;
        if weights.len() != weight_dims * n {
            return Err(TableError::Shape(format!(
                "expected {} weight values, got {}",
                weight_dims * n,
                weights.len()
            )));
        }

        let mut order: Vec<usize> = (0..n).collect();
        let mut tree = TreeArena::new();
        split(&points, dims, &mut order, 0, leaf_size.max(1), &mut tree);

        let mut data = Vec::with_capacity(points.len());
        let mut sorted_weights = Vec::with_capacity(weights.len());
        let mut new_from_old = vec![0; n];
        for (new, &old) in order.iter().enumerate() {
            data.extend_from_slice(&points[old * dims..(old + 1) * dims]);
            sorted_weights.extend_from_slice(&weights[old * weight_dims..(old + 1) * weight_dims]);
            new_from_old[old] = new;
        }

        let block = PointBlock::new(
            dims,
            weight_dims,
            vec![PointRange::new(0, n)],
            data,
            sorted_weights,
            order,
            Some(new_from_old),
        )?;
        Ok(Self { rank, block, tree })
    }

    pub fn rank(&self) -> RankId {
        self.rank
    }

    pub fn block(&self) -> &PointBlock {
        &self.block
    }

    pub fn tree(&self) -> &TreeArena {
        &self.tree
    }

    pub fn root(&self) -> NodeIndex {
        0
    }

    pub fn node(&self, index: NodeIndex) -> Option<&TreeNode> {
        self.tree.get(index)
    }

    /// The shallowest nodes holding at most `max_points` points (or leaves),
    /// which partition the table. Useful for carving the table into fragments.
    pub fn frontier(&self, max_points: usize) -> Vec<NodeIndex> {
        let mut out = Vec::new();
        let mut stack = vec![self.root()];
        while let Some(index) = stack.pop() {
            let Some(node) = self.tree.get(index) else {
                continue;
            };
            if node.count <= max_points || node.is_leaf() {
                out.push(index);
                continue;
            }
            if let Some(right) = node.right {
                stack.push(right);
            }
            if let Some(left) = node.left {
                stack.push(left);
            }
        }
        out
    }
}

fn split(
    points: &[f64],
    dims: usize,
    order: &mut [usize],
    begin: usize,
    leaf_size: usize,
    tree: &mut TreeArena,
) -> NodeIndex {
    let count = order.len();
    let index = tree.push(TreeNode::leaf(begin, count));
    if count <= leaf_size {
        return index;
    }

    let axis = widest_axis(points, dims, order);
    order.sort_by(|&a, &b| points[a * dims + axis].total_cmp(&points[b * dims + axis]));

    let mid = count / 2;
    let (lo, hi) = order.split_at_mut(mid);
    let left = split(points, dims, lo, begin, leaf_size, tree);
    let right = split(points, dims, hi, begin + mid, leaf_size, tree);
    tree.nodes[index].left = Some(left);
    tree.nodes[index].right = Some(right);
    index
}

fn widest_axis(points: &[f64], dims: usize, order: &[usize]) -> usize {
    let mut best = (0, f64::NEG_INFINITY);
    for axis in 0..dims {
        let (lo, hi) = order.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &i| {
            let v = points[i * dims + axis];
            (lo.min(v), hi.max(v))
        });
        if hi - lo > best.1 {
            best = (axis, hi - lo);
        }
    }
    best.0
}

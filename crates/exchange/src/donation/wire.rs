//! Byte layout of a donation.
//!
//! A bundle is a MessagePack map: source and destination ranks, the fragments
//! in bundle position order, then one task list per donated query naming
//! fragments by position. Each fragment ships its tree as a pre-order node
//! list where every node except the first names its parent by index into the
//! nodes already listed.

use serde::{Deserialize, Serialize};

use canopy_core::{FragmentIdentity, PointRange, RankId};

use crate::cache::Role;
use crate::error::{DonationError, TableError};
use crate::fragment::SubTreeFragment;
use crate::table::{PointBlock, PointTable, TreeArena, TreeNode};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireBundle {
    pub source: RankId,
    pub destination: RankId,
    pub fragments: Vec<WireFragment>,
    pub tasks: Vec<WireTaskList>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireNode {
    pub begin: usize,
    pub count: usize,
    pub parent: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFragment {
    pub identity: FragmentIdentity,
    /// Claims held on the fragment in the bundle when it was packed.
    pub as_query: bool,
    pub reference_count: u32,
    pub nodes: Vec<WireNode>,
    pub ranges: Vec<PointRange>,
    pub dims: usize,
    pub weight_dims: usize,
    pub data: Vec<f64>,
    pub weights: Vec<f64>,
    pub old_from_new: Vec<usize>,
    pub has_new_from_old: bool,
    pub new_from_old: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireReference {
    pub position: u32,
    pub work: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireTaskList {
    pub query: u32,
    pub references: Vec<WireReference>,
}

impl WireBundle {
    pub fn encode(&self) -> Result<Vec<u8>, DonationError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DonationError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

impl WireFragment {
    /// Snapshot `fragment` for shipping.
    ///
    /// An alias ships only the rows of its materialized ranges. An owned copy
    /// covering its whole block ships the block as is.
    pub fn capture(
        fragment: &SubTreeFragment,
        role: Role,
        include_reverse: bool,
    ) -> Result<Self, TableError> {
        let block = fragment.table().block();
        let rows = if !fragment.is_borrowed() && block.ranges() == fragment.ranges() {
            block.duplicate(include_reverse)
        } else {
            block.restrict(fragment.ranges(), include_reverse)?
        };

        let nodes = fragment
            .shape()
            .into_iter()
            .map(|(begin, count, parent)| WireNode {
                begin,
                count,
                parent: parent.map(|p| p as u32),
            })
            .collect();

        let (has_new_from_old, new_from_old) = match rows.new_from_old() {
            Some(reverse) => (true, reverse.to_vec()),
            None => (false, Vec::new()),
        };

        Ok(Self {
            identity: fragment.identity(),
            as_query: role.is_query(),
            reference_count: role.reference_count(),
            nodes,
            ranges: rows.ranges().to_vec(),
            dims: rows.dims(),
            weight_dims: rows.weight_dims(),
            data: rows.data().to_vec(),
            weights: rows.weights().to_vec(),
            old_from_new: rows.old_from_new().to_vec(),
            has_new_from_old,
            new_from_old,
        })
    }

    /// Rebuild an owned fragment. `position` only labels errors.
    pub fn materialize(self, position: usize) -> Result<SubTreeFragment, DonationError> {
        let fault = |reason: String| DonationError::Structure { position, reason };

        if self.identity.span().checked_end().is_none() {
            return Err(fault(format!("identity {} overflows the index space", self.identity)));
        }
        if let Some(i) = self
            .nodes
            .iter()
            .position(|n| n.begin.checked_add(n.count).is_none())
        {
            return Err(fault(format!("node {i} overflows the index space")));
        }
        if let Some(i) = self.ranges.iter().position(|r| r.checked_end().is_none()) {
            return Err(fault(format!("range {i} overflows the index space")));
        }

        let mut tree = TreeArena::new();
        for (i, node) in self.nodes.iter().enumerate() {
            match (i, node.parent) {
                (0, None) => {}
                (0, Some(_)) => return Err(fault("root node names a parent".into())),
                (_, None) => return Err(fault(format!("node {i} has no parent"))),
                (_, Some(p)) if p as usize >= i => {
                    return Err(fault(format!(
                        "node {i} names parent {p}, outside the {i} nodes built so far"
                    )))
                }
                _ => {}
            }
            if node.count == 0 {
                return Err(fault(format!("node {i} is empty")));
            }
            let index = tree.push(TreeNode::leaf(node.begin, node.count));
            if let Some(parent) = node.parent {
                tree.attach(parent as usize, index).map_err(|e| fault(e.to_string()))?;
            }
        }

        let root = tree.get(0).ok_or_else(|| fault("fragment has no nodes".into()))?;
        if root.span() != self.identity.span() {
            return Err(fault(format!(
                "root spans {:?}, identity {} says otherwise",
                root.span(),
                self.identity
            )));
        }
        if self.ranges.iter().any(|r| !root.span().covers(r)) {
            return Err(fault("materialized ranges escape the root span".into()));
        }

        let new_from_old = match (self.has_new_from_old, self.new_from_old.is_empty()) {
            (true, _) => Some(self.new_from_old),
            (false, true) => None,
            (false, false) => {
                return Err(fault("reverse permutation present but not flagged".into()))
            }
        };
        let block = PointBlock::new(
            self.dims,
            self.weight_dims,
            self.ranges,
            self.data,
            self.weights,
            self.old_from_new,
            new_from_old,
        )
        .map_err(|e| fault(e.to_string()))?;

        let table = PointTable::from_parts(self.identity.rank, block, tree);
        SubTreeFragment::owned(table).map_err(|e| fault(e.to_string()))
    }
}

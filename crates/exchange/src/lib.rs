//! Task distribution for dual-tree computations spread over many ranks:
//! sub-tree fragments, the per-rank fragment cache and task queue, and the
//! donation protocol that moves work (and the data it needs) between ranks.

pub mod cache;
pub mod donation;
pub mod error;
pub mod fragment;
pub mod queue;
pub mod table;

pub use cache::{CachedFragment, FragmentCache, Rejected, Role};
pub use donation::{import_donation, BuildOutcome, DonationBundle, ImportedDonation, PendingDonation};
pub use error::{CacheFault, DonationError, QueueError, TableError};
pub use fragment::{Backing, SubTreeFragment};
pub use queue::{InsertionOrder, LargestWorkFirst, PriorityPolicy, QuerySlot, Settled, Task, TaskQueue};
pub use table::{NodeIndex, PointBlock, PointTable, TreeArena, TreeNode};

//! Group tree core: records, tree building, structural edits and diffing,
//! shared between the daemon and its clients

pub mod diff;
pub mod error;
pub mod group;
pub mod mutation;
pub mod normalize;
pub mod paths;
pub mod protocol;
pub mod tree;

pub use diff::{diff, is_simple, Change, ChangeBatch, ChangeKind, DiffOptions};
pub use error::TreeError;
pub use group::{is_pending_id, GroupRecord, GroupSeed};
pub use mutation::{
    confirm_created, insert_node, move_nodes, remove_node, rename_node, RenameOutcome,
};
pub use normalize::{AttributeMapping, Field, Normalizer, RecordAccess};
pub use paths::*;
pub use protocol::*;
pub use tree::{Tree, TreeNode, ROOT_ID};

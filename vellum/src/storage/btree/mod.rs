//! Copy-on-write B+-tree over slotted pages.
//!
//! [`node`] holds the on-page layout; [`tree`] holds the algorithms and the
//! persistent [`tree::TreeState`] records kept in the root tree.

pub mod node;
pub mod tree;

pub use node::{NodeError, TreePageKind, max_inline_value, max_key_size};
pub use tree::{Tree, TreeError, TreeIterator, TreeState};

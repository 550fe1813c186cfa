//! Node Tree
//!
//! - [`node`] - node record and arena slot
//! - [`container`] - the [`DataContainer`] owning every node
//! - [`view`] - [`DataView`] over the tree; [`DirectView`] mutates nodes in
//!   place with an undo log
//! - [`workspace`] - MVCC working copies and [`WorkspaceView`]

pub mod container;
pub mod node;
pub mod view;
pub mod workspace;

#[cfg(test)]
mod proptest;

pub use container::{CreatedNodes, DataContainer};
pub use node::{Node, NodeData, NodeSnapshot, TreeNode, Value};
pub use view::{DataView, DirectView, UndoEntry};
pub use workspace::{WorkingNode, Workspace, WorkspaceView};

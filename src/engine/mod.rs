pub(crate) mod propagation;
pub(crate) mod scope;

use std::any::Any;

pub use crate::engine::propagation::{PropagationHandle, Status};

/// Identifier of a node mounted in a tree.
pub type NodeId = petgraph::stable_graph::NodeIndex;

/// The rebuild scheduling primitive a host engine hands to its nodes.
///
/// Marking is idempotent, a node marked twice before the next rebuild pass
/// is built once. The host decides when that pass runs.
pub trait Host {
    fn mark_needs_build(&self, node: NodeId);
}

/// The type-erased contract the host drives for every publishing node.
///
/// Operations that need the published type (mounting, updating, reading the
/// current value) are reached by downcasting through [`Element::as_any`];
/// everything the host does without knowing the type lives here.
pub(crate) trait Element {
    fn published_type_name(&self) -> &'static str;

    fn status(&self) -> Status;

    /// Runs the build step of the propagation node and returns the
    /// dependents that must be rebuilt in the current pass.
    fn build(&self) -> Vec<NodeId>;

    fn unmount(&self);

    fn subscribe(&self, dependent: NodeId);

    fn unsubscribe(&self, dependent: NodeId);

    fn dependents(&self) -> Vec<NodeId>;

    fn as_any(&self) -> &dyn Any;
}

use std::any::TypeId;
use std::collections::HashMap;
use std::rc::Rc;

use crate::engine::NodeId;

/// The publishers visible from one position in the tree.
///
/// Each entry maps a published type to the nearest node publishing it.
/// Scopes are shared between a node and its descendants until a publisher
/// shadows an entry, so a lookup is a single map access instead of a walk
/// over every ancestor.
#[derive(Clone, Default)]
pub(crate) struct Scope {
    table: Rc<HashMap<TypeId, NodeId>>,
}

impl Scope {
    pub(crate) fn nearest(&self, published: TypeId) -> Option<NodeId> {
        self.table.get(&published).copied()
    }

    /// Returns the scope seen below `node`, which publishes `published`.
    pub(crate) fn with(&self, published: TypeId, node: NodeId) -> Scope {
        let mut table = HashMap::clone(&self.table);
        table.insert(published, node);

        Scope {
            table: Rc::new(table),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.table.len()
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.table.values()).finish()
    }
}

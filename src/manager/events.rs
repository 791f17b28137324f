use std::fmt;
use std::sync::Arc;

use crate::model::NodeRef;

/// Nodes touched by one committed transaction.
#[derive(Default, Clone)]
pub struct NodeChangeSet {
    pub inserted: Vec<NodeRef>,
    pub modified: Vec<NodeRef>,
    pub deleted: Vec<NodeRef>,
    /// Nodes whose child list changed.
    pub updated_parents: Vec<NodeRef>,
}

impl NodeChangeSet {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty()
            && self.modified.is_empty()
            && self.deleted.is_empty()
            && self.updated_parents.is_empty()
    }

    /// Number of inserted, modified and deleted nodes.
    pub fn counts(&self) -> (usize, usize, usize) {
        (self.inserted.len(), self.modified.len(), self.deleted.len())
    }
}

impl fmt::Debug for NodeChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids = |nodes: &[NodeRef]| nodes.iter().map(|n| n.id()).collect::<Vec<_>>();
        f.debug_struct("NodeChangeSet")
            .field("inserted", &ids(&self.inserted))
            .field("modified", &ids(&self.modified))
            .field("deleted", &ids(&self.deleted))
            .field("updated_parents", &ids(&self.updated_parents))
            .finish()
    }
}

/// Receives the changes of every successful commit.
///
/// Called on the committing thread after the storage commit, with no
/// manager or transactor lock held.
pub trait NodeChangeListener: Send + Sync {
    fn nodes_changed(&self, changes: &NodeChangeSet);
}

impl<F> NodeChangeListener for F
where
    F: Fn(&NodeChangeSet) + Send + Sync,
{
    fn nodes_changed(&self, changes: &NodeChangeSet) {
        self(changes)
    }
}

/// Shared listener handle.
pub type ListenerRef = Arc<dyn NodeChangeListener>;

use std::fmt;

/// Lifecycle state of a node.
///
/// `Transient` nodes are never stored. Persistent nodes start out `New`,
/// become `Clean` after commit, `Modified` on mutation, `Deleted` once
/// removed and `Invalid` when evicted so they get reloaded on next access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Transient,
    Virtual,
    Invalid,
    Clean,
    New,
    Modified,
    Deleted,
}

impl NodeState {
    /// True for states whose node has (or will have) a stored record.
    pub fn is_persistent(self) -> bool {
        matches!(
            self,
            NodeState::Clean | NodeState::New | NodeState::Modified | NodeState::Deleted
        )
    }

    /// True for states the transactor must flush at commit.
    pub fn is_dirty(self) -> bool {
        matches!(
            self,
            NodeState::New | NodeState::Modified | NodeState::Deleted
        )
    }

    /// States that [`crate::Node::mark_as`] leaves untouched.
    pub(crate) fn is_pinned(self) -> bool {
        matches!(
            self,
            NodeState::Invalid | NodeState::Virtual | NodeState::Transient
        )
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NodeState::Transient => "transient",
            NodeState::Virtual => "virtual",
            NodeState::Invalid => "invalid",
            NodeState::Clean => "clean",
            NodeState::New => "new",
            NodeState::Modified => "modified",
            NodeState::Deleted => "deleted",
        };
        f.write_str(label)
    }
}

//! Node lifecycle coordination: the shared cache, the per-thread
//! transactor and the node manager tying them to a database.

pub mod cache;
pub mod events;
pub mod node_manager;
pub mod transactor;

pub use cache::NodeCache;
pub use events::{ListenerRef, NodeChangeListener, NodeChangeSet};
pub use node_manager::NodeManager;
pub use transactor::Transactor;

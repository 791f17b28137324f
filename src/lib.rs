//! hopdb: an object persistence layer.
//!
//! Applications work with a graph of [`Node`]s. A node starts out transient
//! and becomes persistent when attached below a stored node; from then on
//! every change is tracked by the current thread's [`Transactor`] and
//! written back by the configured backend on commit.
//!
//! ```rust,ignore
//! use hopdb::{AppContext, Config};
//!
//! let app = AppContext::new(Config::default().with_home("db"));
//! let nmgr = app.open_node_manager()?;
//! let tx = nmgr.begin("hello")?;
//! let story = nmgr.root()?.create_node(Some("story"), None)?;
//! story.set_string("title", "Hello")?;
//! tx.commit()?;
//! ```
//!
//! Two backends are available: an embedded store keeping one XML file per
//! node ([`storage::XmlDatabase`]) and a SQLite table
//! ([`storage::SqliteDatabase`]).

pub mod app;
pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
pub mod manager;
pub mod model;
pub mod storage;

pub use app::AppContext;
pub use config::Config;
pub use error::{Error, Result};
pub use logging::{init_logging, log_filter};
pub use manager::{NodeCache, NodeChangeListener, NodeChangeSet, NodeManager, Transactor};
pub use model::{DbKey, DbMapping, MappingRegistry, Node, NodeRef, NodeState, Value};
pub use storage::{BackendKind, Database};

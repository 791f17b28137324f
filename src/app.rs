//! Application context: configuration, mapping registry and the wiring of
//! a node manager to its configured backend.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::codec::WriterOptions;
use crate::config::Config;
use crate::error::Result;
use crate::manager::NodeManager;
use crate::model::MappingRegistry;
use crate::storage::open_backend;

/// Property overriding the id generator's base value.
pub const ID_BASE_PROPERTY: &str = "idBaseValue";

/// Everything a store needs to know about the application using it.
///
/// Passed explicitly to backends and the node manager; there is no
/// process-wide instance.
#[derive(Debug)]
pub struct AppContext {
    config: Config,
    registry: Arc<MappingRegistry>,
}

impl AppContext {
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(MappingRegistry::from_configs(config.mappings.clone()));
        Self { config, registry }
    }

    /// Loads the configuration at `path`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Config::load(path).map(Self::new)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<MappingRegistry> {
        &self.registry
    }

    /// Application property `name`, if set.
    pub fn property(&self, name: &str) -> Option<&str> {
        self.config.properties.get(name).map(String::as_str)
    }

    pub fn charset(&self) -> Option<&str> {
        self.config.charset.as_deref()
    }

    pub fn home(&self) -> &Path {
        &self.config.home
    }

    /// Lowest id a fresh generator may issue. Never below 1; an unparsable
    /// property falls back to 1.
    pub fn id_base_value(&self) -> u64 {
        let configured = match self.property(ID_BASE_PROPERTY) {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(value) => value,
                Err(err) => {
                    warn!(value = raw, error = %err, "ignoring invalid {ID_BASE_PROPERTY}");
                    1
                }
            },
            None => self.config.id_base_value.unwrap_or(1),
        };
        configured.max(1)
    }

    /// Writer options for exporting node trees.
    pub fn tree_options(&self) -> WriterOptions {
        WriterOptions {
            encoding: self.config.charset.clone(),
            ..WriterOptions::tree(self.config.max_levels)
        }
    }

    /// Opens the configured backend below [`home`](Self::home) and returns
    /// a node manager serving it.
    pub fn open_node_manager(&self) -> Result<Arc<NodeManager>> {
        let home: PathBuf = self.config.home.clone();
        let mut db = open_backend(self.config.backend, self.config.sync_on_commit);
        db.init(&home, self)?;
        info!(
            backend = %self.config.backend,
            home = %home.display(),
            "opened store"
        );
        Ok(NodeManager::new(
            db,
            Arc::clone(&self.registry),
            self.config.cache_capacity,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BackendKind;
    use tempfile::tempdir;

    fn with_property(value: &str) -> AppContext {
        let mut config = Config::default();
        config
            .properties
            .insert(ID_BASE_PROPERTY.to_string(), value.to_string());
        AppContext::new(config)
    }

    #[test]
    fn id_base_prefers_property() {
        let mut config = Config::default();
        config.id_base_value = Some(50);
        assert_eq!(AppContext::new(config).id_base_value(), 50);
        assert_eq!(with_property("1000").id_base_value(), 1000);
    }

    #[test]
    fn id_base_falls_back_to_one() {
        assert_eq!(AppContext::new(Config::default()).id_base_value(), 1);
        assert_eq!(with_property("many").id_base_value(), 1);
        assert_eq!(with_property("0").id_base_value(), 1);
    }

    #[test]
    fn registry_comes_from_config() {
        let config = Config::parse("[mappings.Story]\nstorage = \"stories\"\n").unwrap();
        let app = AppContext::new(config);
        let story = app.registry().get("Story").unwrap();
        assert_eq!(story.storage_type_name(), Some("stories"));
    }

    #[test]
    fn opens_both_backends() {
        for backend in [BackendKind::Xml, BackendKind::Sqlite] {
            let dir = tempdir().unwrap();
            let app = AppContext::new(
                Config::default()
                    .with_home(dir.path())
                    .with_backend(backend),
            );
            let nmgr = app.open_node_manager().unwrap();
            assert_eq!(nmgr.db().kind(), backend);
            assert_eq!(nmgr.root().unwrap().name(), "root");
            let users = nmgr.user_root().unwrap();
            assert_eq!(users.name(), "users");
            assert_eq!(users.prototype(), "__userroot__");
            nmgr.shutdown().unwrap();
        }
    }
}

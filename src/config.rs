//! TOML configuration for a hopdb application.
//!
//! ```toml
//! backend = "xml"
//! home = "db"
//! charset = "UTF-8"
//! cache_capacity = 500
//!
//! [properties]
//! idBaseValue = "1000"
//!
//! [mappings.Story]
//! subnode_prototype = "Comment"
//! properties.author = { kind = "reference", prototype = "User" }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::manager::cache::DEFAULT_CAPACITY;
use crate::model::MappingConfig;
use crate::storage::BackendKind;

/// Default depth used when exporting node trees.
pub const DEFAULT_MAX_LEVELS: usize = 3;

/// Settings read from a `hopdb.toml` file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub backend: BackendKind,
    /// Directory holding the store. [`Config::load`] resolves a relative
    /// path against the directory of the loaded file; configs built with
    /// [`Config::parse`] or [`Config::default`] keep it as given.
    pub home: PathBuf,
    /// Encoding named in the declaration of written records.
    pub charset: Option<String>,
    /// Lowest id the generator hands out on a fresh store. The
    /// `idBaseValue` property takes precedence.
    pub id_base_value: Option<u64>,
    pub cache_capacity: usize,
    /// Nesting depth of exported trees.
    pub max_levels: usize,
    /// Fsync records and the store directory on every commit.
    pub sync_on_commit: bool,
    /// Free-form application properties.
    pub properties: BTreeMap<String, String>,
    /// Prototype mappings keyed by prototype name.
    pub mappings: BTreeMap<String, MappingConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            home: PathBuf::from("db"),
            charset: None,
            id_base_value: None,
            cache_capacity: DEFAULT_CAPACITY,
            max_levels: DEFAULT_MAX_LEVELS,
            sync_on_commit: true,
            properties: BTreeMap::new(),
            mappings: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Reads and parses a configuration file. A relative `home` is resolved
    /// against the file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|err| Error::Config {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        let mut config = Self::parse(&contents).map_err(|err| match err {
            Error::Config { reason, .. } => Error::Config {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })?;
        if config.home.is_relative() {
            if let Some(dir) = path.parent() {
                config.home = dir.join(&config.home);
            }
        }
        Ok(config)
    }

    /// Parses configuration from TOML text.
    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|err| Error::Config {
            path: PathBuf::from("<string>"),
            reason: err.message().to_string(),
        })
    }

    /// Builder-style override of the store directory.
    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = home.into();
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RelationKind;
    use tempfile::tempdir;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.backend, BackendKind::Xml);
        assert_eq!(config.cache_capacity, DEFAULT_CAPACITY);
        assert!(config.sync_on_commit);
        assert!(config.mappings.is_empty());
    }

    #[test]
    fn parses_backend_and_mappings() {
        let config = Config::parse(
            r#"
            backend = "sqlite"
            charset = "ISO-8859-1"
            id_base_value = 500

            [properties]
            idBaseValue = "1000"

            [mappings.Story]
            subnode_prototype = "Comment"
            properties.author = { kind = "reference", prototype = "User" }
            "#,
        )
        .unwrap();
        assert_eq!(config.backend, BackendKind::Sqlite);
        assert_eq!(config.charset.as_deref(), Some("ISO-8859-1"));
        assert_eq!(config.id_base_value, Some(500));
        assert_eq!(config.properties["idBaseValue"], "1000");
        let story = &config.mappings["Story"];
        assert_eq!(story.subnode_prototype.as_deref(), Some("Comment"));
        assert_eq!(story.properties["author"].kind, RelationKind::Reference);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Config::parse("bakend = \"xml\"").unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn load_resolves_home_next_to_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hopdb.toml");
        fs::write(&path, "home = \"store\"\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.home, dir.path().join("store"));

        let parsed = Config::parse("home = \"store\"\n").unwrap();
        assert_eq!(parsed.home, std::path::PathBuf::from("store"));
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        match Config::load(&missing) {
            Err(Error::Config { path, .. }) => assert_eq!(path, missing),
            other => panic!("unexpected {other:?}"),
        }
    }
}

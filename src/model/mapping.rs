//! Per-prototype mapping metadata.
//!
//! A [`DbMapping`] says, for one prototype, which storage space its nodes
//! live in and how individual property names relate to storage: plain
//! columns, references to nodes of another prototype, or virtual relations
//! that synthesise a child node on first access. Mappings are declared in
//! configuration ([`MappingConfig`]) and resolved lazily by the
//! [`MappingRegistry`], which also follows `extends` chains.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::warn;

/// Maximum length of an `extends` chain before resolution gives up.
const MAX_INHERITANCE_DEPTH: usize = 32;

/// How a property name maps onto storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
    /// A literal value, optionally stored in a named column.
    #[default]
    Primitive,
    /// A reference to a single node of the relation's prototype.
    Reference,
    /// A synthetic child node grouping nodes of the relation's prototype.
    Virtual,
}

/// Declaration of one property relation, as read from configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelationConfig {
    pub kind: RelationKind,
    pub column: Option<String>,
    pub prototype: Option<String>,
}

/// Declaration of one prototype's mapping, as read from configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MappingConfig {
    /// Prototype this one inherits relations and storage from.
    pub extends: Option<String>,
    /// Name of the storage space (table) holding nodes of this prototype.
    pub storage: Option<String>,
    /// Prototype assigned to nodes created inside nodes of this prototype.
    pub subnode_prototype: Option<String>,
    pub properties: BTreeMap<String, RelationConfig>,
}

/// A resolved property relation.
#[derive(Debug)]
pub struct Relation {
    prop_name: String,
    kind: RelationKind,
    column: Option<String>,
    prototype: Option<String>,
    virtual_mapping: Option<Arc<DbMapping>>,
}

impl Relation {
    fn resolve(owner: &str, prop_name: &str, config: &RelationConfig) -> Self {
        let virtual_mapping = (config.kind == RelationKind::Virtual).then(|| {
            Arc::new(DbMapping {
                prototype: format!("{owner}.{prop_name}"),
                parent: None,
                storage: None,
                subnode_prototype: config.prototype.clone(),
                relations: HashMap::new(),
            })
        });
        Self {
            prop_name: prop_name.to_string(),
            kind: config.kind,
            column: config.column.clone(),
            prototype: config.prototype.clone(),
            virtual_mapping,
        }
    }

    pub fn prop_name(&self) -> &str {
        &self.prop_name
    }

    pub fn kind(&self) -> RelationKind {
        self.kind
    }

    pub fn is_virtual(&self) -> bool {
        self.kind == RelationKind::Virtual
    }

    pub fn is_reference(&self) -> bool {
        self.kind == RelationKind::Reference
    }

    /// Storage column, defaulting to the property name.
    pub fn column(&self) -> &str {
        self.column.as_deref().unwrap_or(&self.prop_name)
    }

    /// Prototype of the node(s) this relation points to.
    pub fn prototype(&self) -> Option<&str> {
        self.prototype.as_deref()
    }

    /// Mapping assigned to the synthetic node of a virtual relation.
    pub fn virtual_mapping(&self) -> Option<&Arc<DbMapping>> {
        self.virtual_mapping.as_ref()
    }
}

/// Resolved mapping of one prototype.
#[derive(Debug)]
pub struct DbMapping {
    prototype: String,
    parent: Option<Arc<DbMapping>>,
    storage: Option<String>,
    subnode_prototype: Option<String>,
    relations: HashMap<String, Arc<Relation>>,
}

impl DbMapping {
    /// Mapping with no relations, used for prototypes without configuration.
    pub fn bare(prototype: impl Into<String>) -> Self {
        Self {
            prototype: prototype.into(),
            parent: None,
            storage: None,
            subnode_prototype: None,
            relations: HashMap::new(),
        }
    }

    pub fn prototype_name(&self) -> &str {
        &self.prototype
    }

    pub fn parent_mapping(&self) -> Option<&Arc<DbMapping>> {
        self.parent.as_ref()
    }

    /// Storage space of this mapping or the closest ancestor that has one.
    pub fn storage_type_name(&self) -> Option<&str> {
        match &self.storage {
            Some(storage) => Some(storage),
            None => self.parent.as_ref().and_then(|p| p.storage_type_name()),
        }
    }

    /// True when nodes are kept in a relational storage space.
    pub fn is_relational(&self) -> bool {
        self.storage_type_name().is_some()
    }

    pub fn subnode_prototype(&self) -> Option<&str> {
        match &self.subnode_prototype {
            Some(proto) => Some(proto),
            None => self.parent.as_ref().and_then(|p| p.subnode_prototype()),
        }
    }

    /// Relation declared for `prop_name` here or in an ancestor.
    ///
    /// Lookup is case-insensitive.
    pub fn property_relation(&self, prop_name: &str) -> Option<&Arc<Relation>> {
        let key = prop_name.to_lowercase();
        self.relations.get(&key).or_else(|| {
            self.parent
                .as_ref()
                .and_then(|p| p.property_relation(&key))
        })
    }

    /// Column used to store `prop_name`.
    pub fn property_to_column(&self, prop_name: &str) -> String {
        self.property_relation(prop_name)
            .map(|rel| rel.column().to_string())
            .unwrap_or_else(|| prop_name.to_string())
    }

    /// Property stored in `column`, if any relation declares it.
    pub fn column_to_property(&self, column: &str) -> Option<&str> {
        self.relations
            .values()
            .find(|rel| rel.column().eq_ignore_ascii_case(column))
            .map(|rel| rel.prop_name())
            .or_else(|| self.parent.as_ref().and_then(|p| p.column_to_property(column)))
    }

    /// True if this mapping is `prototype` or inherits from it.
    pub fn is_instance_of(&self, prototype: &str) -> bool {
        self.prototype == prototype
            || self
                .parent
                .as_ref()
                .is_some_and(|p| p.is_instance_of(prototype))
    }

    /// Names of the properties declared directly on this mapping.
    pub fn declared_properties(&self) -> impl Iterator<Item = &str> {
        self.relations.values().map(|rel| rel.prop_name())
    }
}

/// Registry resolving prototype names to mappings on first use.
#[derive(Debug, Default)]
pub struct MappingRegistry {
    configs: RwLock<HashMap<String, MappingConfig>>,
    resolved: RwLock<HashMap<String, Arc<DbMapping>>>,
}

impl MappingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(configs: BTreeMap<String, MappingConfig>) -> Self {
        let registry = Self::new();
        for (prototype, config) in configs {
            registry.register(prototype, config);
        }
        registry
    }

    /// Adds or replaces a mapping declaration and drops resolved mappings.
    pub fn register(&self, prototype: impl Into<String>, config: MappingConfig) {
        self.configs.write().insert(prototype.into(), config);
        self.resolved.write().clear();
    }

    pub fn contains(&self, prototype: &str) -> bool {
        self.configs.read().contains_key(prototype)
    }

    pub fn prototypes(&self) -> Vec<String> {
        let mut names: Vec<_> = self.configs.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolved mapping for `prototype`, or `None` if it was never declared.
    pub fn get(&self, prototype: &str) -> Option<Arc<DbMapping>> {
        if let Some(mapping) = self.resolved.read().get(prototype) {
            return Some(Arc::clone(mapping));
        }
        let configs = self.configs.read();
        let mapping = Self::resolve(&configs, prototype, 0)?;
        let mut resolved = self.resolved.write();
        Some(Arc::clone(
            resolved.entry(prototype.to_string()).or_insert(mapping),
        ))
    }

    fn resolve(
        configs: &HashMap<String, MappingConfig>,
        prototype: &str,
        depth: usize,
    ) -> Option<Arc<DbMapping>> {
        let config = configs.get(prototype)?;
        if depth > MAX_INHERITANCE_DEPTH {
            warn!(prototype, "mapping inheritance too deep, ignoring extends");
            return None;
        }
        let parent = config
            .extends
            .as_deref()
            .and_then(|parent| Self::resolve(configs, parent, depth + 1));
        let relations = config
            .properties
            .iter()
            .map(|(name, rel)| {
                (
                    name.to_lowercase(),
                    Arc::new(Relation::resolve(prototype, name, rel)),
                )
            })
            .collect();
        Some(Arc::new(DbMapping {
            prototype: prototype.to_string(),
            parent,
            storage: config.storage.clone(),
            subnode_prototype: config.subnode_prototype.clone(),
            relations,
        }))
    }
}

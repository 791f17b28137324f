//! Node data model: values, properties, keys, mappings and nodes.

pub mod children;
pub mod key;
pub mod mapping;
pub mod node;
pub mod property;
pub mod state;
pub mod value;

pub use children::ChildList;
pub use key::{DbKey, NodeHandle};
pub use mapping::{DbMapping, MappingConfig, MappingRegistry, Relation, RelationConfig, RelationKind};
pub use node::{now_millis, Node, NodeParts, NodeRef, NodeSnapshot, ParentLink, DEFAULT_PROTOTYPE};
pub use property::Property;
pub use state::NodeState;
pub use value::{FromValue, OpaqueObject, PropertyType, Value};

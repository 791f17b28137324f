use super::value::{PropertyType, Value};

/// One named value cell owned by exactly one node.
///
/// Replacing the value of a cell drops whatever it held before, so a cell
/// that changes from a node reference to a literal no longer keeps the old
/// target alive.
#[derive(Debug, Clone)]
pub struct Property {
    name: String,
    value: Value,
}

impl Property {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn property_type(&self) -> PropertyType {
        self.value.property_type()
    }

    /// Stores `value`, returning false when it equals the current literal.
    pub fn set(&mut self, value: Value) -> bool {
        if self.value.same_as(&value) {
            return false;
        }
        self.value = value;
        true
    }

    /// Stores `value` unconditionally and returns the previous one.
    ///
    /// Used when the representation changes but the target does not, such
    /// as a direct node handle giving way to its key.
    pub fn replace(&mut self, value: Value) -> Value {
        std::mem::replace(&mut self.value, value)
    }

    pub fn into_value(self) -> Value {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::value::OpaqueObject;

    #[test]
    fn set_reports_changes() {
        let mut prop = Property::new("title", Value::from("a"));
        assert!(!prop.set(Value::from("a")));
        assert!(prop.set(Value::from("b")));
        assert!(prop.set(Value::Integer(3)));
        assert_eq!(prop.property_type(), PropertyType::Integer);
    }

    #[test]
    fn replace_swaps_even_equal_values() {
        let mut prop = Property::new("title", Value::from("a"));
        let old = prop.replace(Value::from("a"));
        assert!(old.same_as(&Value::from("a")));
        let old = prop.replace(Value::Boolean(true));
        assert_eq!(old.property_type(), PropertyType::String);
        assert_eq!(prop.property_type(), PropertyType::Boolean);
    }

    #[test]
    fn changing_type_drops_reference() {
        let obj = OpaqueObject::new(String::from("payload"));
        let mut prop = Property::new("blob", Value::JavaObject(obj.clone()));
        assert!(prop.set(Value::Boolean(true)));
        assert!(!prop.value().is_reference());
        assert_eq!(prop.name(), "blob");
    }
}

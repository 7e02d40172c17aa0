// SPDX-License-Identifier: MIT

//! Payload schema definitions

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Schema declaring types and merge reducers for payload fields
#[derive(Debug, Clone, Deserialize, Serialize, Default, JsonSchema)]
pub struct StateSchema {
    /// Field definitions
    #[serde(flatten)]
    pub fields: HashMap<String, StateFieldDef>,
}

/// Definition of a single payload field
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct StateFieldDef {
    /// Type of the field
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Reducer for merging node outputs
    #[serde(default)]
    pub reducer: ReducerType,
}

/// Supported field types
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl FieldType {
    /// Whether a value conforms to this type (null is accepted for every type)
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (FieldType::String, Value::String(_)) => true,
            (FieldType::Number, Value::Number(_)) => true,
            (FieldType::Boolean, Value::Bool(_)) => true,
            (FieldType::Array, Value::Array(_)) => true,
            (FieldType::Object, Value::Object(_)) => true,
            _ => false,
        }
    }
}

/// Reducer types for merging node outputs into the payload
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ReducerType {
    /// Replace the value (default)
    #[default]
    Overwrite,
    /// Append to array
    Append,
    /// Keep maximum value
    Max,
    /// Keep minimum value
    Min,
    /// Shallow-merge objects
    Merge,
}

impl StateSchema {
    /// Reducer for a field, `Overwrite` when undeclared
    pub fn reducer_for(&self, key: &str) -> ReducerType {
        self.fields
            .get(key)
            .map(|def| def.reducer)
            .unwrap_or_default()
    }

    /// Check a value against the declared field type, if any
    pub fn check(&self, key: &str, value: &Value) -> Result<(), String> {
        match self.fields.get(key) {
            Some(def) if !def.field_type.accepts(value) => Err(format!(
                "field '{}' expects {:?}, got {}",
                key, def.field_type, value
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_schema_deserialize() {
        let yaml = r#"
            complexity:
              type: string
            results:
              type: array
              reducer: append
        "#;
        let schema: StateSchema = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(schema.fields.len(), 2);
        assert_eq!(schema.fields["complexity"].field_type, FieldType::String);
        assert_eq!(schema.reducer_for("results"), ReducerType::Append);
        assert_eq!(schema.reducer_for("undeclared"), ReducerType::Overwrite);
    }

    #[test]
    fn test_all_reducers() {
        let yaml = r#"
            f1: { type: string, reducer: overwrite }
            f2: { type: array, reducer: append }
            f3: { type: number, reducer: max }
            f4: { type: number, reducer: min }
            f5: { type: object, reducer: merge }
        "#;
        let schema: StateSchema = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(schema.fields["f1"].reducer, ReducerType::Overwrite);
        assert_eq!(schema.fields["f2"].reducer, ReducerType::Append);
        assert_eq!(schema.fields["f3"].reducer, ReducerType::Max);
        assert_eq!(schema.fields["f4"].reducer, ReducerType::Min);
        assert_eq!(schema.fields["f5"].reducer, ReducerType::Merge);
    }

    #[test]
    fn test_type_check() {
        let yaml = r#"
            complexity: { type: string }
        "#;
        let schema: StateSchema = serde_yaml::from_str(yaml).unwrap();

        assert!(schema.check("complexity", &json!("low")).is_ok());
        assert!(schema.check("complexity", &json!(null)).is_ok());
        assert!(schema.check("complexity", &json!(3)).is_err());
        assert!(schema.check("other", &json!(3)).is_ok());
    }
}

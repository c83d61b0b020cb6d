//! `GType` schema trees.
//!
//! Schemas are runtime inputs: they arrive with handler and module
//! manifests and are consulted at admission and at handler boundaries.
//! A schema is a tagged variant tree of primitives, objects, arrays, and
//! references into a [`SchemaRegistry`], each with an optional nullable
//! flag.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// One schema violation, with the JSON-pointer-like path where it occurred.
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// A schema node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GType {
    String {
        #[serde(default)]
        nullable: bool,
        #[serde(default)]
        min_length: Option<usize>,
        #[serde(default)]
        max_length: Option<usize>,
        /// Closed set of accepted values, when present.
        #[serde(default, rename = "enum")]
        one_of: Option<Vec<String>>,
    },
    Number {
        #[serde(default)]
        nullable: bool,
        #[serde(default)]
        minimum: Option<f64>,
        #[serde(default)]
        maximum: Option<f64>,
    },
    Boolean {
        #[serde(default)]
        nullable: bool,
    },
    Object {
        #[serde(default)]
        nullable: bool,
        #[serde(default)]
        properties: BTreeMap<String, GType>,
        #[serde(default)]
        required: BTreeSet<String>,
        /// Whether keys outside `properties` are accepted.
        #[serde(default = "default_true")]
        additional_properties: bool,
    },
    Array {
        #[serde(default)]
        nullable: bool,
        item: Box<GType>,
        #[serde(default)]
        min_items: Option<usize>,
        #[serde(default)]
        max_items: Option<usize>,
    },
    Ref {
        #[serde(default)]
        nullable: bool,
        target: String,
    },
}

fn default_true() -> bool {
    true
}

impl GType {
    fn nullable(&self) -> bool {
        match self {
            GType::String { nullable, .. }
            | GType::Number { nullable, .. }
            | GType::Boolean { nullable }
            | GType::Object { nullable, .. }
            | GType::Array { nullable, .. }
            | GType::Ref { nullable, .. } => *nullable,
        }
    }

    /// Validate a JSON value against this schema, resolving references
    /// through the registry. Returns all violations found; an empty vector
    /// means the value conforms.
    pub fn validate(&self, value: &serde_json::Value, registry: &SchemaRegistry) -> Vec<Violation> {
        let mut violations = Vec::new();
        self.validate_at(value, registry, "$", 0, &mut violations);
        violations
    }

    fn validate_at(
        &self,
        value: &serde_json::Value,
        registry: &SchemaRegistry,
        path: &str,
        depth: usize,
        out: &mut Vec<Violation>,
    ) {
        // Guard against pathological or cyclic ref chains.
        if depth > 64 {
            out.push(Violation {
                path: path.to_string(),
                message: "schema nesting exceeds supported depth".to_string(),
            });
            return;
        }
        if value.is_null() {
            if !self.nullable() {
                out.push(Violation {
                    path: path.to_string(),
                    message: "value must not be null".to_string(),
                });
            }
            return;
        }
        match self {
            GType::String {
                min_length,
                max_length,
                one_of,
                ..
            } => {
                let Some(s) = value.as_str() else {
                    out.push(type_violation(path, "string", value));
                    return;
                };
                if let Some(min) = min_length {
                    if s.chars().count() < *min {
                        out.push(Violation {
                            path: path.to_string(),
                            message: format!("shorter than minimum length {min}"),
                        });
                    }
                }
                if let Some(max) = max_length {
                    if s.chars().count() > *max {
                        out.push(Violation {
                            path: path.to_string(),
                            message: format!("longer than maximum length {max}"),
                        });
                    }
                }
                if let Some(allowed) = one_of {
                    if !allowed.iter().any(|a| a == s) {
                        out.push(Violation {
                            path: path.to_string(),
                            message: format!("'{s}' is not one of the allowed values"),
                        });
                    }
                }
            }
            GType::Number { minimum, maximum, .. } => {
                let Some(n) = value.as_f64() else {
                    out.push(type_violation(path, "number", value));
                    return;
                };
                if let Some(min) = minimum {
                    if n < *min {
                        out.push(Violation {
                            path: path.to_string(),
                            message: format!("{n} is below minimum {min}"),
                        });
                    }
                }
                if let Some(max) = maximum {
                    if n > *max {
                        out.push(Violation {
                            path: path.to_string(),
                            message: format!("{n} is above maximum {max}"),
                        });
                    }
                }
            }
            GType::Boolean { .. } => {
                if !value.is_boolean() {
                    out.push(type_violation(path, "boolean", value));
                }
            }
            GType::Object {
                properties,
                required,
                additional_properties,
                ..
            } => {
                let Some(map) = value.as_object() else {
                    out.push(type_violation(path, "object", value));
                    return;
                };
                for key in required {
                    if !map.contains_key(key) {
                        out.push(Violation {
                            path: format!("{path}.{key}"),
                            message: "required property is missing".to_string(),
                        });
                    }
                }
                for (key, child) in map {
                    match properties.get(key) {
                        Some(schema) => schema.validate_at(
                            child,
                            registry,
                            &format!("{path}.{key}"),
                            depth + 1,
                            out,
                        ),
                        None if !additional_properties => out.push(Violation {
                            path: format!("{path}.{key}"),
                            message: "unexpected property".to_string(),
                        }),
                        None => {}
                    }
                }
            }
            GType::Array {
                item,
                min_items,
                max_items,
                ..
            } => {
                let Some(items) = value.as_array() else {
                    out.push(type_violation(path, "array", value));
                    return;
                };
                if let Some(min) = min_items {
                    if items.len() < *min {
                        out.push(Violation {
                            path: path.to_string(),
                            message: format!("fewer than {min} items"),
                        });
                    }
                }
                if let Some(max) = max_items {
                    if items.len() > *max {
                        out.push(Violation {
                            path: path.to_string(),
                            message: format!("more than {max} items"),
                        });
                    }
                }
                for (i, child) in items.iter().enumerate() {
                    item.validate_at(child, registry, &format!("{path}[{i}]"), depth + 1, out);
                }
            }
            GType::Ref { target, .. } => match registry.get(target) {
                Some(schema) => schema.validate_at(value, registry, path, depth + 1, out),
                None => out.push(Violation {
                    path: path.to_string(),
                    message: format!("unresolved schema reference '{target}'"),
                }),
            },
        }
    }
}

fn type_violation(path: &str, expected: &str, actual: &serde_json::Value) -> Violation {
    let actual = match actual {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    };
    Violation {
        path: path.to_string(),
        message: format!("expected {expected}, got {actual}"),
    }
}

/// Id-indexed catalog of named schemas, for `ref` resolution.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, GType>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, schema: GType) {
        self.schemas.insert(id.into(), schema);
    }

    pub fn get(&self, id: &str) -> Option<&GType> {
        self.schemas.get(id)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user_schema() -> GType {
        GType::Object {
            nullable: false,
            properties: BTreeMap::from([
                (
                    "name".to_string(),
                    GType::String {
                        nullable: false,
                        min_length: Some(1),
                        max_length: Some(64),
                        one_of: None,
                    },
                ),
                (
                    "age".to_string(),
                    GType::Number {
                        nullable: true,
                        minimum: Some(0.0),
                        maximum: Some(150.0),
                    },
                ),
            ]),
            required: BTreeSet::from(["name".to_string()]),
            additional_properties: false,
        }
    }

    #[test]
    fn valid_object_produces_no_violations() {
        let registry = SchemaRegistry::new();
        let violations = user_schema().validate(&json!({"name": "ada", "age": 36}), &registry);
        assert!(violations.is_empty(), "{violations:?}");
    }

    #[test]
    fn missing_required_property_is_flagged() {
        let registry = SchemaRegistry::new();
        let violations = user_schema().validate(&json!({"age": 3}), &registry);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].path, "$.name");
    }

    #[test]
    fn additional_properties_flag_is_enforced() {
        let registry = SchemaRegistry::new();
        let violations = user_schema().validate(&json!({"name": "a", "extra": 1}), &registry);
        assert!(violations.iter().any(|v| v.path == "$.extra"));
    }

    #[test]
    fn nullable_allows_null() {
        let registry = SchemaRegistry::new();
        let violations = user_schema().validate(&json!({"name": "a", "age": null}), &registry);
        assert!(violations.is_empty());
    }

    #[test]
    fn refs_resolve_through_registry() {
        let mut registry = SchemaRegistry::new();
        registry.register("user", user_schema());
        let list = GType::Array {
            nullable: false,
            item: Box::new(GType::Ref {
                nullable: false,
                target: "user".to_string(),
            }),
            min_items: Some(1),
            max_items: None,
        };
        assert!(list.validate(&json!([{"name": "a"}]), &registry).is_empty());
        let violations = list.validate(&json!([{"age": 1}]), &registry);
        assert_eq!(violations[0].path, "$[0].name");
    }

    #[test]
    fn unresolved_ref_is_a_violation() {
        let registry = SchemaRegistry::new();
        let schema = GType::Ref {
            nullable: false,
            target: "ghost".to_string(),
        };
        let violations = schema.validate(&json!(1), &registry);
        assert!(violations[0].message.contains("ghost"));
    }

    #[test]
    fn schema_round_trips_through_json() {
        let schema = user_schema();
        let text = serde_json::to_string(&schema).unwrap();
        let back: GType = serde_json::from_str(&text).unwrap();
        assert_eq!(back, schema);
    }

    #[test]
    fn string_enum_constraint() {
        let registry = SchemaRegistry::new();
        let schema = GType::String {
            nullable: false,
            min_length: None,
            max_length: None,
            one_of: Some(vec!["red".into(), "green".into()]),
        };
        assert!(schema.validate(&json!("red"), &registry).is_empty());
        assert_eq!(schema.validate(&json!("blue"), &registry).len(), 1);
    }
}

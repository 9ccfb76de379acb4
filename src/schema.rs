//! Declarative value schemas and the validation pipeline.
//!
//! A [`Schema`] describes the shape a JSON value must have. Validation never
//! panics and never throws: it returns a [`ValidationFailure`] that the caller
//! maps to a transport-specific error (400 for inbound data, log-and-drop for
//! outbound stream/duplex messages).

use serde_json::Value;
use thiserror::Error;

/// A declared shape for procedure input or output values.
///
/// Object field order is preserved from declaration; extra fields not named
/// by the schema are tolerated.
#[derive(Debug, Clone, PartialEq)]
pub enum Schema {
    /// Accepts any value, including null.
    Any,
    /// Accepts only JSON null.
    Null,
    /// Accepts true/false.
    Boolean,
    /// Accepts integral numbers.
    Integer,
    /// Accepts any JSON number.
    Number,
    /// Accepts strings, optionally length-bounded.
    String {
        /// Minimum length in characters, inclusive.
        min_len: Option<usize>,
        /// Maximum length in characters, inclusive.
        max_len: Option<usize>,
    },
    /// Accepts arrays whose every element matches `items`.
    Array {
        /// Schema each element must satisfy.
        items: Box<Schema>,
    },
    /// Accepts objects with the declared fields.
    Object {
        /// Declared fields in declaration order.
        fields: Vec<ObjectField>,
    },
}

/// One declared field of an object schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectField {
    /// Field name.
    pub name: String,
    /// Schema the field value must satisfy.
    pub schema: Schema,
    /// Whether the field must be present. Optional fields are validated
    /// only when present.
    pub required: bool,
}

/// A structured validation failure: where in the value it happened and why.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("at {path}: {reason}")]
pub struct ValidationFailure {
    /// JSON-path-ish location of the offending value, `$` for the root.
    pub path: String,
    /// Human-readable reason.
    pub reason: String,
}

impl Schema {
    /// Unbounded string schema.
    pub fn string() -> Self {
        Schema::String { min_len: None, max_len: None }
    }

    /// String schema with inclusive length bounds.
    pub fn string_bounded(min_len: Option<usize>, max_len: Option<usize>) -> Self {
        Schema::String { min_len, max_len }
    }

    /// Array schema.
    pub fn array(items: Schema) -> Self {
        Schema::Array { items: Box::new(items) }
    }

    /// Object schema from `(name, schema, required)` triples, preserving
    /// declaration order.
    pub fn object<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = (S, Schema, bool)>,
        S: Into<String>,
    {
        Schema::Object {
            fields: fields
                .into_iter()
                .map(|(name, schema, required)| ObjectField {
                    name: name.into(),
                    schema,
                    required,
                })
                .collect(),
        }
    }

    /// Check `value` against this schema.
    ///
    /// Returns the first failure encountered, depth-first in declaration
    /// order. The value itself is untouched; on success the caller keeps
    /// using the value it already holds.
    pub fn validate(&self, value: &Value) -> Result<(), ValidationFailure> {
        self.validate_at(value, "$")
    }

    fn validate_at(&self, value: &Value, path: &str) -> Result<(), ValidationFailure> {
        match self {
            Schema::Any => Ok(()),
            Schema::Null => match value {
                Value::Null => Ok(()),
                other => Err(mismatch(path, "null", other)),
            },
            Schema::Boolean => match value {
                Value::Bool(_) => Ok(()),
                other => Err(mismatch(path, "boolean", other)),
            },
            Schema::Integer => match value {
                Value::Number(n) if n.is_i64() || n.is_u64() => Ok(()),
                other => Err(mismatch(path, "integer", other)),
            },
            Schema::Number => match value {
                Value::Number(_) => Ok(()),
                other => Err(mismatch(path, "number", other)),
            },
            Schema::String { min_len, max_len } => match value {
                Value::String(s) => {
                    let len = s.chars().count();
                    if let Some(min) = min_len {
                        if len < *min {
                            return Err(ValidationFailure {
                                path: path.to_string(),
                                reason: format!("string length {len} is below minimum {min}"),
                            });
                        }
                    }
                    if let Some(max) = max_len {
                        if len > *max {
                            return Err(ValidationFailure {
                                path: path.to_string(),
                                reason: format!("string length {len} exceeds maximum {max}"),
                            });
                        }
                    }
                    Ok(())
                }
                other => Err(mismatch(path, "string", other)),
            },
            Schema::Array { items } => match value {
                Value::Array(elements) => {
                    for (index, element) in elements.iter().enumerate() {
                        items.validate_at(element, &format!("{path}[{index}]"))?;
                    }
                    Ok(())
                }
                other => Err(mismatch(path, "array", other)),
            },
            Schema::Object { fields } => match value {
                Value::Object(map) => {
                    for field in fields {
                        match map.get(&field.name) {
                            Some(inner) => {
                                field
                                    .schema
                                    .validate_at(inner, &format!("{path}.{}", field.name))?;
                            }
                            None if field.required => {
                                return Err(ValidationFailure {
                                    path: path.to_string(),
                                    reason: format!("missing required field {}", field.name),
                                });
                            }
                            None => {}
                        }
                    }
                    Ok(())
                }
                other => Err(mismatch(path, "object", other)),
            },
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn mismatch(path: &str, expected: &str, found: &Value) -> ValidationFailure {
    ValidationFailure {
        path: path.to_string(),
        reason: format!("expected {expected}, found {}", type_name(found)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_any_accepts_everything() {
        for value in [json!(null), json!(true), json!(42), json!("x"), json!([1]), json!({})] {
            assert!(Schema::Any.validate(&value).is_ok());
        }
    }

    #[test]
    fn test_missing_required_field() {
        let schema = Schema::object([("id", Schema::string(), true)]);
        let failure = schema.validate(&json!({})).unwrap_err();
        assert_eq!(failure.path, "$");
        assert!(failure.reason.contains("id"));
    }

    #[test]
    fn test_optional_field_absent_is_ok() {
        let schema = Schema::object([("note", Schema::string(), false)]);
        assert!(schema.validate(&json!({})).is_ok());
        assert!(schema.validate(&json!({"note": 7})).is_err());
    }

    #[test]
    fn test_extra_fields_tolerated() {
        let schema = Schema::object([("id", Schema::string(), true)]);
        assert!(schema.validate(&json!({"id": "u1", "extra": true})).is_ok());
    }

    #[test]
    fn test_nested_failure_reports_path() {
        let schema = Schema::object([(
            "user",
            Schema::object([("name", Schema::string(), true)]),
            true,
        )]);
        let failure = schema.validate(&json!({"user": {"name": 3}})).unwrap_err();
        assert_eq!(failure.path, "$.user.name");
    }

    #[test]
    fn test_array_element_path() {
        let schema = Schema::array(Schema::Integer);
        let failure = schema.validate(&json!([1, 2, "three"])).unwrap_err();
        assert_eq!(failure.path, "$[2]");
    }

    #[test]
    fn test_string_length_bounds() {
        let schema = Schema::string_bounded(Some(2), Some(3));
        assert!(schema.validate(&json!("ab")).is_ok());
        assert!(schema.validate(&json!("a")).is_err());
        assert!(schema.validate(&json!("abcd")).is_err());
    }

    #[test]
    fn test_integer_rejects_float() {
        assert!(Schema::Integer.validate(&json!(1.5)).is_err());
        assert!(Schema::Integer.validate(&json!(7)).is_ok());
        assert!(Schema::Number.validate(&json!(1.5)).is_ok());
    }
}

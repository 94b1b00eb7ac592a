//! Payload shapes and the schema port.
//!
//! Tasks declare their input and output as a [`Schema`]: a small structural
//! shape algebra, not a full JSON Schema implementation. The fluent compiler
//! uses [`Schema::accepts`] for pairwise compatibility checks and
//! [`Schema::unify`] to find a common shape for branch arms. At runtime the
//! scheduler validates payloads through the [`PayloadValidator`] port so a
//! host can substitute a richer validator; [`ShapeValidator`] is the default
//! structural implementation.

use std::collections::BTreeMap;
use std::fmt;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Structural shape of a payload flowing between nodes.
///
/// `Object` lists *required* fields; payloads may carry extra keys.
/// `Tuple` is a fixed-length heterogeneous sequence and is what a
/// `parallel` node produces. `Any` opts out of checking.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schema {
    Any,
    Null,
    Bool,
    Integer,
    Number,
    String,
    Array(Box<Schema>),
    Tuple(Vec<Schema>),
    Object(BTreeMap<String, Schema>),
}

impl Schema {
    /// An array of uniformly-shaped elements.
    #[must_use]
    pub fn array(element: Schema) -> Self {
        Schema::Array(Box::new(element))
    }

    /// An object with the given required fields.
    #[must_use]
    pub fn object<K: Into<String>>(fields: impl IntoIterator<Item = (K, Schema)>) -> Self {
        Schema::Object(fields.into_iter().map(|(k, s)| (k.into(), s)).collect())
    }

    /// Assignment compatibility: can a value of shape `incoming` be used
    /// where `self` is expected?
    ///
    /// `Any` on either side short-circuits to compatible. `Integer` flows
    /// into `Number`. A `Tuple` flows into an `Array` when every element
    /// does. Objects are width-subtyped: `incoming` must carry at least the
    /// fields `self` declares.
    #[must_use]
    pub fn accepts(&self, incoming: &Schema) -> bool {
        match (self, incoming) {
            (Schema::Any, _) | (_, Schema::Any) => true,
            (Schema::Number, Schema::Integer) => true,
            (Schema::Array(a), Schema::Array(b)) => a.accepts(b),
            (Schema::Array(a), Schema::Tuple(items)) => items.iter().all(|t| a.accepts(t)),
            (Schema::Tuple(a), Schema::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.accepts(y))
            }
            (Schema::Object(want), Schema::Object(have)) => want
                .iter()
                .all(|(key, shape)| have.get(key).is_some_and(|h| shape.accepts(h))),
            (a, b) => a == b,
        }
    }

    /// Least common shape of two schemas, if one exists.
    ///
    /// Used to type the output of a `branch` node: every arm must unify
    /// into a single shape or compilation fails.
    #[must_use]
    pub fn unify(&self, other: &Schema) -> Option<Schema> {
        if self == other {
            return Some(self.clone());
        }
        match (self, other) {
            (Schema::Any, _) | (_, Schema::Any) => Some(Schema::Any),
            (Schema::Number, Schema::Integer) | (Schema::Integer, Schema::Number) => {
                Some(Schema::Number)
            }
            (Schema::Array(a), Schema::Array(b)) => {
                a.unify(b).map(|e| Schema::Array(Box::new(e)))
            }
            (Schema::Object(a), Schema::Object(b)) => {
                // Common fields with unifiable shapes; divergent fields drop out.
                let mut fields = BTreeMap::new();
                for (key, shape) in a {
                    if let Some(merged) = b.get(key).and_then(|o| shape.unify(o)) {
                        fields.insert(key.clone(), merged);
                    }
                }
                Some(Schema::Object(fields))
            }
            (a, b) => {
                if a.accepts(b) {
                    Some(a.clone())
                } else if b.accepts(a) {
                    Some(b.clone())
                } else {
                    None
                }
            }
        }
    }

    /// Element shape when this schema is used as the input of a `for_each`.
    #[must_use]
    pub(crate) fn element_shape(&self) -> Option<Schema> {
        match self {
            Schema::Any => Some(Schema::Any),
            Schema::Array(element) => Some((**element).clone()),
            Schema::Tuple(items) => {
                let mut shape = items.first().cloned().unwrap_or(Schema::Any);
                for item in items.iter().skip(1) {
                    shape = shape.unify(item)?;
                }
                Some(shape)
            }
            _ => None,
        }
    }

    fn shape_of(value: &Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schema::Any => write!(f, "any"),
            Schema::Null => write!(f, "null"),
            Schema::Bool => write!(f, "bool"),
            Schema::Integer => write!(f, "integer"),
            Schema::Number => write!(f, "number"),
            Schema::String => write!(f, "string"),
            Schema::Array(e) => write!(f, "array<{e}>"),
            Schema::Tuple(items) => {
                write!(f, "tuple[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Schema::Object(fields) => {
                write!(f, "object{{")?;
                for (i, (key, shape)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key}: {shape}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// A structural mismatch between a payload and its declared schema.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Error, Diagnostic)]
#[error("invalid payload at {path}: expected {expected}, found {found}")]
#[diagnostic(
    code(rillflow::schema::invalid_payload),
    help("Check the task's declared input/output schema against the value produced upstream.")
)]
pub struct ValidationFault {
    /// Dotted path into the payload, `$` for the root.
    pub path: String,
    pub expected: String,
    pub found: String,
}

/// Port through which the engine validates user payloads.
///
/// The host may supply a richer implementation (e.g. a real JSON Schema
/// validator); the engine only requires that a conforming value comes back
/// normalized, or a [`ValidationFault`] describing the first mismatch.
pub trait PayloadValidator: Send + Sync {
    fn validate(&self, schema: &Schema, payload: &Value) -> Result<Value, ValidationFault>;
}

/// Default validator: checks the payload's structure against the shape
/// algebra and returns the payload unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct ShapeValidator;

impl ShapeValidator {
    fn check(schema: &Schema, payload: &Value, path: &str) -> Result<(), ValidationFault> {
        let fault = |expected: String| ValidationFault {
            path: path.to_string(),
            expected,
            found: Schema::shape_of(payload).to_string(),
        };
        match schema {
            Schema::Any => Ok(()),
            Schema::Null if payload.is_null() => Ok(()),
            Schema::Bool if payload.is_boolean() => Ok(()),
            Schema::Integer if payload.as_i64().is_some() || payload.as_u64().is_some() => Ok(()),
            Schema::Number if payload.is_number() => Ok(()),
            Schema::String if payload.is_string() => Ok(()),
            Schema::Array(element) => {
                let items = payload.as_array().ok_or_else(|| fault(schema.to_string()))?;
                for (i, item) in items.iter().enumerate() {
                    Self::check(element, item, &format!("{path}[{i}]"))?;
                }
                Ok(())
            }
            Schema::Tuple(shapes) => {
                let items = payload.as_array().ok_or_else(|| fault(schema.to_string()))?;
                if items.len() != shapes.len() {
                    return Err(fault(schema.to_string()));
                }
                for (i, (shape, item)) in shapes.iter().zip(items).enumerate() {
                    Self::check(shape, item, &format!("{path}[{i}]"))?;
                }
                Ok(())
            }
            Schema::Object(fields) => {
                let map = payload.as_object().ok_or_else(|| fault(schema.to_string()))?;
                for (key, shape) in fields {
                    let child = map.get(key).ok_or_else(|| ValidationFault {
                        path: format!("{path}.{key}"),
                        expected: shape.to_string(),
                        found: "missing".to_string(),
                    })?;
                    Self::check(shape, child, &format!("{path}.{key}"))?;
                }
                Ok(())
            }
            _ => Err(fault(schema.to_string())),
        }
    }
}

impl PayloadValidator for ShapeValidator {
    fn validate(&self, schema: &Schema, payload: &Value) -> Result<Value, ValidationFault> {
        Self::check(schema, payload, "$")?;
        Ok(payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn integer_flows_into_number() {
        assert!(Schema::Number.accepts(&Schema::Integer));
        assert!(!Schema::Integer.accepts(&Schema::Number));
    }

    #[test]
    fn object_width_subtyping() {
        let want = Schema::object([("result", Schema::Integer)]);
        let have = Schema::object([("result", Schema::Integer), ("tag", Schema::String)]);
        assert!(want.accepts(&have));
        assert!(!have.accepts(&want));
    }

    #[test]
    fn tuple_flows_into_array() {
        let tuple = Schema::Tuple(vec![Schema::Integer, Schema::Integer]);
        assert!(Schema::array(Schema::Number).accepts(&tuple));
    }

    #[test]
    fn unify_branch_arms() {
        let low = Schema::object([("result", Schema::Integer), ("tag", Schema::String)]);
        let high = Schema::object([("result", Schema::Number), ("tag", Schema::String)]);
        let merged = low.unify(&high).unwrap();
        assert_eq!(
            merged,
            Schema::object([("result", Schema::Number), ("tag", Schema::String)])
        );
        assert!(Schema::Bool.unify(&Schema::String).is_none());
    }

    #[test]
    fn shape_validator_reports_path() {
        let schema = Schema::object([("items", Schema::array(Schema::Integer))]);
        let fault = ShapeValidator
            .validate(&schema, &json!({"items": [1, "two"]}))
            .unwrap_err();
        assert_eq!(fault.path, "$.items[1]");
        assert_eq!(fault.found, "string");
    }

    #[test]
    fn shape_validator_allows_extra_keys() {
        let schema = Schema::object([("value", Schema::Integer)]);
        let payload = json!({"value": 3, "trace": "abc"});
        assert_eq!(ShapeValidator.validate(&schema, &payload).unwrap(), payload);
    }
}

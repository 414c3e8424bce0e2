//! Schema advisory: best-effort argument checks against discovered schemas.
//!
//! Schemas come from `tools/list` and are never authoritative. A schema that
//! cannot be read is ignored, and a failed check only produces diagnostics.
//! Calls always go through.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde_json::Value;

/// Runtime kind of a JSON value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValueKind {
    Null,
    Boolean,
    Number,
    String,
    Array,
    Object,
}

impl ValueKind {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Boolean,
            Value::Number(_) => ValueKind::Number,
            Value::String(_) => ValueKind::String,
            Value::Array(_) => ValueKind::Array,
            Value::Object(_) => ValueKind::Object,
        }
    }

    /// Map a JSON Schema `type` keyword. `integer` checks as a number.
    pub fn from_schema_type(name: &str) -> Option<Self> {
        match name {
            "null" => Some(ValueKind::Null),
            "boolean" => Some(ValueKind::Boolean),
            "number" | "integer" => Some(ValueKind::Number),
            "string" => Some(ValueKind::String),
            "array" => Some(ValueKind::Array),
            "object" => Some(ValueKind::Object),
            _ => None,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Null => "null",
            ValueKind::Boolean => "boolean",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Array => "array",
            ValueKind::Object => "object",
        };
        f.write_str(name)
    }
}

/// Declared shape of one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldShape {
    /// The `type` keyword as written, used in diagnostics.
    pub declared: String,
    /// Kinds that satisfy the declaration.
    pub kinds: BTreeSet<ValueKind>,
}

/// Structural view of a tool's input schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolSchema {
    pub required: Vec<String>,
    pub properties: BTreeMap<String, FieldShape>,
}

impl ToolSchema {
    /// Read the parts of a JSON Schema the advisory understands.
    ///
    /// Returns `None` for anything that is not an object. Unknown or
    /// malformed keywords are skipped rather than rejected.
    pub fn from_value(schema: &Value) -> Option<Self> {
        let schema = schema.as_object()?;

        let required = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|fields| {
                fields
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let mut properties = BTreeMap::new();
        if let Some(props) = schema.get("properties").and_then(Value::as_object) {
            for (field, decl) in props {
                if let Some(shape) = decl.get("type").and_then(field_shape) {
                    properties.insert(field.clone(), shape);
                }
            }
        }

        Some(Self {
            required,
            properties,
        })
    }
}

fn field_shape(type_decl: &Value) -> Option<FieldShape> {
    match type_decl {
        Value::String(name) => {
            let kind = ValueKind::from_schema_type(name)?;
            Some(FieldShape {
                declared: name.clone(),
                kinds: BTreeSet::from([kind]),
            })
        }
        // `"type": ["string", "null"]`
        Value::Array(names) => {
            let names: Vec<&str> = names.iter().filter_map(Value::as_str).collect();
            let kinds: BTreeSet<ValueKind> = names
                .iter()
                .filter_map(|n| ValueKind::from_schema_type(n))
                .collect();
            if kinds.is_empty() {
                return None;
            }
            Some(FieldShape {
                declared: names.join(" | "),
                kinds,
            })
        }
        _ => None,
    }
}

/// Check `args` against the schema on file for `tool`.
///
/// Returns human-readable diagnostics; an empty list means nothing to report
/// (which includes "no schema on file" and "args not an object").
pub fn check(
    server: &str,
    tool: &str,
    args: &Value,
    schemas: &HashMap<String, ToolSchema>,
) -> Vec<String> {
    let Some(schema) = schemas.get(tool) else {
        return Vec::new();
    };
    let Some(args) = args.as_object() else {
        return Vec::new();
    };

    let mut diagnostics = Vec::new();
    for field in &schema.required {
        if !args.contains_key(field) {
            diagnostics.push(format!("missing required field \"{field}\""));
        }
    }

    for (field, value) in args {
        let Some(shape) = schema.properties.get(field) else {
            continue;
        };
        let actual = ValueKind::of(value);
        if actual == ValueKind::Null || shape.kinds.contains(&actual) {
            continue;
        }
        diagnostics.push(format!(
            "field \"{field}\" expected {}, got {actual}",
            shape.declared
        ));
    }

    if !diagnostics.is_empty() {
        tracing::trace!(server, tool, count = diagnostics.len(), "schema advisory findings");
    }
    diagnostics
}

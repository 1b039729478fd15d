//! GType schema language and validator.
//!
//! A [`GType`] is a finite tree (boxed children, so no cycles can be built).
//! [`validate`] walks the tree once and reports every violation it finds,
//! never stopping at the first one.

mod violation;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use violation::Violation;

/// Primitive kinds understood by the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveKind {
    String,
    Number,
    Integer,
    Boolean,
    Null,
    Any,
}

impl PrimitiveKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrimitiveKind::String => "string",
            PrimitiveKind::Number => "number",
            PrimitiveKind::Integer => "integer",
            PrimitiveKind::Boolean => "boolean",
            PrimitiveKind::Null => "null",
            PrimitiveKind::Any => "any",
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            PrimitiveKind::String => value.is_string(),
            PrimitiveKind::Number => value.is_number(),
            PrimitiveKind::Integer => value.is_i64() || value.is_u64(),
            PrimitiveKind::Boolean => value.is_boolean(),
            PrimitiveKind::Null => value.is_null(),
            PrimitiveKind::Any => true,
        }
    }
}

/// Recursive schema description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GType {
    Primitive {
        kind: PrimitiveKind,
    },
    Object {
        #[serde(default)]
        fields: BTreeMap<String, GType>,
        #[serde(default)]
        required: BTreeSet<String>,
        /// Open objects ignore fields they do not declare
        #[serde(default = "GType::default_additional")]
        additional: bool,
    },
    Array {
        element: Box<GType>,
    },
    Union {
        variants: Vec<GType>,
    },
    Intersection {
        parts: Vec<GType>,
    },
}

impl GType {
    fn default_additional() -> bool {
        true
    }

    pub fn primitive(kind: PrimitiveKind) -> Self {
        GType::Primitive { kind }
    }

    pub fn string() -> Self {
        Self::primitive(PrimitiveKind::String)
    }

    pub fn number() -> Self {
        Self::primitive(PrimitiveKind::Number)
    }

    pub fn integer() -> Self {
        Self::primitive(PrimitiveKind::Integer)
    }

    pub fn boolean() -> Self {
        Self::primitive(PrimitiveKind::Boolean)
    }

    pub fn null() -> Self {
        Self::primitive(PrimitiveKind::Null)
    }

    pub fn any() -> Self {
        Self::primitive(PrimitiveKind::Any)
    }

    /// Open object; every listed field with `true` is required.
    pub fn object<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, GType, bool)>,
        K: Into<String>,
    {
        let mut map = BTreeMap::new();
        let mut required = BTreeSet::new();
        for (name, ty, is_required) in fields {
            let name = name.into();
            if is_required {
                required.insert(name.clone());
            }
            map.insert(name, ty);
        }
        GType::Object {
            fields: map,
            required,
            additional: true,
        }
    }

    /// Turn an object schema into a closed one. Other schemas are returned unchanged.
    pub fn closed(self) -> Self {
        match self {
            GType::Object {
                fields, required, ..
            } => GType::Object {
                fields,
                required,
                additional: false,
            },
            other => other,
        }
    }

    pub fn array(element: GType) -> Self {
        GType::Array {
            element: Box::new(element),
        }
    }

    pub fn union(variants: Vec<GType>) -> Self {
        GType::Union { variants }
    }

    pub fn intersection(parts: Vec<GType>) -> Self {
        GType::Intersection { parts }
    }

    /// Human-readable kind used as the `expected` side of a violation.
    pub fn describe(&self) -> String {
        match self {
            GType::Primitive { kind } => kind.as_str().to_string(),
            GType::Object { .. } => "object".to_string(),
            GType::Array { element } => format!("array<{}>", element.describe()),
            GType::Union { variants } => format!(
                "union[{}]",
                variants
                    .iter()
                    .map(GType::describe)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            GType::Intersection { parts } => format!(
                "intersection[{}]",
                parts
                    .iter()
                    .map(GType::describe)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }
}

/// Kind of a JSON value as reported in the `actual` side of a violation.
pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Validate `payload` against `schema`; an empty result means valid.
pub fn validate(payload: &Value, schema: &GType) -> Vec<Violation> {
    let mut violations = Vec::new();
    walk(payload, schema, "", &mut violations);
    violations
}

/// Convenience wrapper for callers that only need a yes/no answer.
pub fn is_valid(payload: &Value, schema: &GType) -> bool {
    validate(payload, schema).is_empty()
}

fn walk(value: &Value, schema: &GType, path: &str, out: &mut Vec<Violation>) {
    match schema {
        GType::Primitive { kind } => {
            if !kind.accepts(value) {
                out.push(Violation::new(path, kind.as_str(), value_kind(value)));
            }
        }
        GType::Object {
            fields,
            required,
            additional,
        } => {
            let Some(map) = value.as_object() else {
                out.push(Violation::new(path, "object", value_kind(value)));
                return;
            };
            for name in required {
                if !map.contains_key(name) {
                    let expected = fields
                        .get(name)
                        .map_or_else(|| "any".to_string(), GType::describe);
                    out.push(Violation::new(&join(path, name), expected, "missing"));
                }
            }
            for (name, field_schema) in fields {
                if let Some(field_value) = map.get(name) {
                    walk(field_value, field_schema, &join(path, name), out);
                }
            }
            if !additional {
                let mut extra: Vec<&String> =
                    map.keys().filter(|k| !fields.contains_key(*k)).collect();
                extra.sort();
                for name in extra {
                    let actual = map.get(name.as_str()).map_or("null", value_kind);
                    out.push(Violation::new(&join(path, name), "absent", actual));
                }
            }
        }
        GType::Array { element } => {
            let Some(items) = value.as_array() else {
                out.push(Violation::new(path, schema.describe(), value_kind(value)));
                return;
            };
            for (idx, item) in items.iter().enumerate() {
                walk(item, element, &format!("{path}[{idx}]"), out);
            }
        }
        GType::Union { variants } => {
            let mut causes = Vec::new();
            for variant in variants {
                let mut variant_violations = Vec::new();
                walk(value, variant, path, &mut variant_violations);
                if variant_violations.is_empty() {
                    return;
                }
                causes.extend(variant_violations);
            }
            out.push(
                Violation::new(path, schema.describe(), value_kind(value)).with_causes(causes),
            );
        }
        GType::Intersection { parts } => {
            let mut found = Vec::new();
            for part in parts {
                walk(value, part, path, &mut found);
            }
            for v in found {
                if !out.contains(&v) {
                    out.push(v);
                }
            }
        }
    }
}

fn join(parent: &str, field: &str) -> String {
    if parent.is_empty() {
        field.to_string()
    } else {
        format!("{parent}.{field}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user_schema() -> GType {
        GType::object([
            ("id", GType::integer(), true),
            ("name", GType::string(), true),
            (
                "address",
                GType::object([
                    ("city", GType::string(), true),
                    ("zip", GType::string(), true),
                ]),
                false,
            ),
            ("tags", GType::array(GType::string()), false),
        ])
    }

    #[test]
    fn test_valid_payload_has_no_violations() {
        let payload = json!({
            "id": 7,
            "name": "ada",
            "address": {"city": "London", "zip": "N1"},
            "tags": ["a", "b"],
            "extra": true
        });
        assert!(validate(&payload, &user_schema()).is_empty());
    }

    #[test]
    fn test_collects_every_violation_with_paths() {
        let payload = json!({
            "id": "seven",
            "address": {"city": "London", "zip": 12345},
            "tags": ["a", 2, "c", false]
        });
        let violations = validate(&payload, &user_schema());
        let paths: Vec<&str> = violations.iter().map(|v| v.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["name", "address.zip", "id", "tags[1]", "tags[3]"]
        );

        let zip = &violations[1];
        assert_eq!(zip.expected, "string");
        assert_eq!(zip.actual, "integer");
        assert_eq!(violations[0].actual, "missing");
    }

    #[test]
    fn test_validation_is_repeatable() {
        let payload = json!({"id": null, "tags": {}});
        let first = validate(&payload, &user_schema());
        let second = validate(&payload, &user_schema());
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn test_closed_object_reports_extra_fields() {
        let schema = GType::object([("id", GType::integer(), true)]).closed();
        let violations = validate(&json!({"id": 1, "b": "x", "a": [1]}), &schema);
        assert_eq!(violations.len(), 2);
        assert_eq!(violations[0].path, "a");
        assert_eq!(violations[0].expected, "absent");
        assert_eq!(violations[0].actual, "array");
        assert_eq!(violations[1].path, "b");
    }

    #[test]
    fn test_union_accepts_any_variant() {
        let schema = GType::union(vec![GType::string(), GType::integer()]);
        assert!(is_valid(&json!("x"), &schema));
        assert!(is_valid(&json!(3), &schema));

        let violations = validate(&json!(1.5), &schema);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].expected, "union[string, integer]");
        assert_eq!(violations[0].actual, "number");
        assert_eq!(violations[0].causes.len(), 2);
    }

    #[test]
    fn test_intersection_requires_all_parts() {
        let schema = GType::intersection(vec![
            GType::object([("id", GType::integer(), true)]),
            GType::object([
                ("id", GType::integer(), true),
                ("email", GType::string(), true),
            ]),
        ]);
        assert!(is_valid(&json!({"id": 1, "email": "a@b"}), &schema));

        let violations = validate(&json!({"name": "x"}), &schema);
        // the shared missing `id` is reported once
        assert_eq!(violations.len(), 2);
        assert!(violations.iter().any(|v| v.path == "id"));
        assert!(violations.iter().any(|v| v.path == "email"));
    }

    #[test]
    fn test_root_type_mismatch() {
        let violations = validate(&json!([1, 2]), &user_schema());
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].path, "");
        assert_eq!(violations[0].to_string(), "$: expected object, got array");
    }

    #[test]
    fn test_number_accepts_integers() {
        assert!(is_valid(&json!(3), &GType::number()));
        assert!(!is_valid(&json!(3.5), &GType::integer()));
        assert!(is_valid(&json!({"anything": [null]}), &GType::any()));
    }

    #[test]
    fn test_deserialize_from_yaml() {
        let yaml = r#"
type: object
required: [id]
fields:
  id: { type: primitive, kind: integer }
  roles:
    type: array
    element: { type: union, variants: [ { type: primitive, kind: string }, { type: primitive, kind: "null" } ] }
"#;
        let schema: GType = serde_yaml::from_str(yaml).unwrap();
        assert!(is_valid(&json!({"id": 1, "roles": ["a", null]}), &schema));
        assert!(!is_valid(&json!({"roles": [1]}), &schema));
    }
}

//! Tool argument schema handling.
//!
//! Two concerns live here: canonical schema signatures (used to tell apart
//! same-named tools on different servers) and a best-effort JSON-schema
//! validation of model-produced arguments. The validator covers the subset
//! of JSON Schema that tool servers actually publish; anything it does not
//! understand is treated as matching.

use serde_json::Value;

/// Render a JSON value canonically: object keys sorted, no whitespace.
/// Equal schemas always produce equal strings.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}

/// Schema signature for fast equality checks between candidates.
/// Empty or trivially-empty schemas produce an empty signature.
pub fn signature_from_json(schema: &Value) -> String {
    if schema_is_empty(schema) {
        return String::new();
    }
    canonical_json(schema)
}

/// Whether a schema constrains nothing.
pub fn schema_is_empty(schema: &Value) -> bool {
    match schema {
        Value::Null => true,
        Value::Object(map) => {
            map.is_empty()
                || map.iter().all(|(k, v)| match k.as_str() {
                    "type" => v == "object",
                    "properties" => v.as_object().map(|o| o.is_empty()).unwrap_or(false),
                    "required" => v.as_array().map(|a| a.is_empty()).unwrap_or(false),
                    "additionalProperties" => true,
                    _ => false,
                })
        }
        _ => false,
    }
}

/// Best-effort check that `args` satisfies `schema`.
///
/// Understands `type`, `required`, `properties`, `items`, `enum` and the
/// `anyOf`/`oneOf`/`allOf` combinators. An empty schema always matches.
pub fn args_match_schema(args: &Value, schema: &Value) -> bool {
    if schema_is_empty(schema) {
        return true;
    }
    let Some(obj) = schema.as_object() else {
        return true;
    };

    if let Some(variants) = obj.get("anyOf").or_else(|| obj.get("oneOf")).and_then(Value::as_array)
    {
        return variants.iter().any(|v| args_match_schema(args, v));
    }
    if let Some(all) = obj.get("allOf").and_then(Value::as_array) {
        return all.iter().all(|v| args_match_schema(args, v));
    }

    if let Some(expected) = obj.get("type").and_then(Value::as_str) {
        if !value_has_type(args, expected) {
            return false;
        }
    }

    if let Some(allowed) = obj.get("enum").and_then(Value::as_array) {
        if !allowed.contains(args) {
            return false;
        }
    }

    if let Some(required) = obj.get("required").and_then(Value::as_array) {
        let Some(fields) = args.as_object() else {
            return false;
        };
        for name in required.iter().filter_map(Value::as_str) {
            if !fields.contains_key(name) {
                return false;
            }
        }
    }

    if let Some(properties) = obj.get("properties").and_then(Value::as_object) {
        if let Some(fields) = args.as_object() {
            for (name, field_schema) in properties {
                if let Some(field) = fields.get(name) {
                    if !args_match_schema(field, field_schema) {
                        return false;
                    }
                }
            }
        }
    }

    if let Some(item_schema) = obj.get("items") {
        if let Some(items) = args.as_array() {
            if !items.iter().all(|item| args_match_schema(item, item_schema)) {
                return false;
            }
        }
    }

    true
}

fn value_has_type(value: &Value, expected: &str) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
        "number" => value.is_number(),
        "null" => value.is_null(),
        // Unknown type keyword: do not reject.
        _ => true,
    }
}

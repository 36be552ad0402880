//! Output-schema preparation for services with strict structured-output
//! modes.

use serde_json::{json, Value};

/// Recursively tighten every object sub-schema: `additionalProperties` is
/// forced to `false` and every declared property becomes `required`. Applies
/// through `items`, `oneOf`, `anyOf` and `allOf`.
pub fn strictify_schema(schema: &mut Value) {
    let Some(obj) = schema.as_object_mut() else {
        return;
    };

    let property_keys: Option<Vec<String>> = obj
        .get("properties")
        .and_then(Value::as_object)
        .map(|props| props.keys().cloned().collect());

    if let Some(keys) = property_keys {
        obj.insert("additionalProperties".to_string(), json!(false));
        obj.insert("required".to_string(), json!(keys));
        if let Some(props) = obj.get_mut("properties").and_then(Value::as_object_mut) {
            for sub in props.values_mut() {
                strictify_schema(sub);
            }
        }
    }

    if let Some(items) = obj.get_mut("items") {
        match items {
            Value::Array(list) => {
                for sub in list {
                    strictify_schema(sub);
                }
            }
            other => strictify_schema(other),
        }
    }

    for combinator in ["oneOf", "anyOf", "allOf"] {
        if let Some(list) = obj.get_mut(combinator).and_then(Value::as_array_mut) {
            for sub in list {
                strictify_schema(sub);
            }
        }
    }
}

//! The mandatory `instructions` argument injected into every tool schema.
//!
//! The model explains each call in this field; the engine shows it to the
//! user and strips it before the tool itself runs.

use serde_json::{Map, Value, json};

/// Argument key carrying the model's justification for a call.
pub const INSTRUCTIONS_KEY: &str = "instructions";

const INSTRUCTIONS_DESCRIPTION: &str = "Please briefly explain: 1) Why you are calling this tool \
2) What information or task you expect to accomplish with this tool. This explanation will be \
shown to users to help them understand the AI's thinking process. 3) In the explanation, use the \
specific tool name instead of saying 'this tool'.";

/// Return `schema` with a required string `instructions` property added.
/// Non-object schemas are replaced by an object schema.
pub fn with_instructions(schema: &Value) -> Value {
    let mut schema = match schema {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    schema.insert("type".into(), json!("object"));

    let properties = schema
        .entry("properties")
        .or_insert_with(|| Value::Object(Map::new()));
    if !properties.is_object() {
        *properties = Value::Object(Map::new());
    }
    if let Some(props) = properties.as_object_mut() {
        props.insert(
            INSTRUCTIONS_KEY.into(),
            json!({"type": "string", "description": INSTRUCTIONS_DESCRIPTION}),
        );
    }

    let required = schema.entry("required").or_insert_with(|| json!([]));
    if !required.is_array() {
        *required = json!([]);
    }
    if let Some(list) = required.as_array_mut()
        && !list.iter().any(|v| v == INSTRUCTIONS_KEY)
    {
        list.push(json!(INSTRUCTIONS_KEY));
    }

    Value::Object(schema)
}

/// Split the justification off a call's arguments.
///
/// Returns the `instructions` text (if it was a string) and the remaining
/// arguments as an object. Non-object arguments yield an empty object.
pub fn split_instructions(arguments: &Value) -> (Option<String>, Map<String, Value>) {
    let mut args = match arguments {
        Value::Object(map) => map.clone(),
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        },
        _ => Map::new(),
    };
    let instructions = match args.remove(INSTRUCTIONS_KEY) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    };
    (instructions, args)
}

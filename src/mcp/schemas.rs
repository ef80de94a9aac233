use rust_mcp_schema::ToolInputSchema;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

// Helper to create a JSON schema property
fn create_prop(type_str: &str, description: &str) -> Map<String, Value> {
    match json!({
        "type": type_str,
        "description": description
    }) {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

fn create_prop_with_minimum(type_str: &str, description: &str, minimum: u32) -> Map<String, Value> {
    match json!({
        "type": type_str,
        "description": description,
        "minimum": minimum
    }) {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

fn create_enum_prop(enum_values: Vec<&str>, default_value: &str, description: &str) -> Map<String, Value> {
    match json!({
        "type": "string",
        "enum": enum_values,
        "default": default_value,
        "description": description
    }) {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

fn session_id_prop() -> Map<String, Value> {
    create_prop("string", "ID of the debug session, as returned by create_debug_session.")
}

pub fn get_config_schema() -> ToolInputSchema {
    ToolInputSchema::new(vec![], None)
}

pub fn create_debug_session_schema() -> ToolInputSchema {
    let mut properties = HashMap::new();
    properties.insert(
        "language".to_string(),
        create_enum_prop(vec!["python", "javascript", "go"], "python", "Language of the program to debug. Only 'python' is currently implemented."),
    );
    properties.insert("name".to_string(), create_prop("string", "Optional human-readable session name. Defaults to 'session-<id prefix>'."));
    properties.insert(
        "python_path".to_string(),
        create_prop("string", "Optional Python interpreter for this session. Falls back to PYTHON_PATH, then the platform default."),
    );
    ToolInputSchema::new(vec!["language".to_string()], Some(properties))
}

pub fn list_debug_sessions_schema() -> ToolInputSchema {
    ToolInputSchema::new(vec![], None)
}

pub fn start_debugging_schema() -> ToolInputSchema {
    let mut properties = HashMap::new();
    properties.insert("session_id".to_string(), session_id_prop());
    ToolInputSchema::new(vec!["session_id".to_string()], Some(properties))
}

pub fn set_breakpoint_schema() -> ToolInputSchema {
    let mut properties = HashMap::new();
    properties.insert("session_id".to_string(), session_id_prop());
    properties.insert("file".to_string(), create_prop("string", "Path of the source file. Absolute paths are recommended."));
    properties.insert("line".to_string(), create_prop_with_minimum("integer", "1-based line number.", 1));
    properties.insert("condition".to_string(), create_prop("string", "Optional condition expression evaluated by the debugger."));
    ToolInputSchema::new(
        vec!["session_id".to_string(), "file".to_string(), "line".to_string()],
        Some(properties),
    )
}

pub fn remove_breakpoint_schema() -> ToolInputSchema {
    let mut properties = HashMap::new();
    properties.insert("session_id".to_string(), session_id_prop());
    properties.insert("breakpoint_id".to_string(), create_prop("string", "ID returned by set_breakpoint."));
    ToolInputSchema::new(
        vec!["session_id".to_string(), "breakpoint_id".to_string()],
        Some(properties),
    )
}

pub fn close_debug_session_schema() -> ToolInputSchema {
    let mut properties = HashMap::new();
    properties.insert("session_id".to_string(), session_id_prop());
    ToolInputSchema::new(vec!["session_id".to_string()], Some(properties))
}

//! GraphQL integration adapter
//!
//! Tools with a registered GraphQL operation POST
//! `{ query, variables }` to the tool's endpoint. There is no introspection:
//! the operation string is stored on the tool record, and tool arguments map
//! onto variables through the configured name mapping.

use std::collections::HashMap;
use std::time::Duration;

use http::header::HeaderMap;
use serde_json::{Value, json};

use mcpgate_core::{GatewayError, GatewayResult};

/// Execute a registered GraphQL operation.
pub async fn execute_graphql(
    client: &reqwest::Client,
    url: &str,
    operation: &str,
    variables_mapping: &HashMap<String, String>,
    args: &Value,
    headers: HeaderMap,
    timeout: Duration,
) -> GatewayResult<Value> {
    let variables = map_variables(variables_mapping, args);
    let response = client
        .post(url)
        .headers(headers)
        .timeout(timeout)
        .json(&json!({ "query": operation, "variables": variables }))
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                GatewayError::timeout("graphql", timeout.as_millis() as u64)
            } else if e.is_connect() {
                GatewayError::unavailable(format!("graphql connect: {e}"))
            } else {
                GatewayError::upstream(e.to_string())
            }
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(GatewayError::upstream_with_status(
            "graphql endpoint rejected request",
            status.as_u16(),
        ));
    }
    let body: Value = response
        .json()
        .await
        .map_err(|e| GatewayError::upstream(format!("graphql body: {e}")))?;

    if let Some(errors) = body.get("errors").and_then(Value::as_array)
        && !errors.is_empty()
    {
        let first = errors[0]
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unspecified");
        return Err(GatewayError::upstream(format!("graphql error: {first}")));
    }
    Ok(body.get("data").cloned().unwrap_or(Value::Null))
}

/// Rename tool arguments into GraphQL variables; unmapped keys pass through
/// under their own names.
fn map_variables(mapping: &HashMap<String, String>, args: &Value) -> Value {
    let Some(args) = args.as_object() else {
        return json!({});
    };
    let mut variables = serde_json::Map::new();
    for (key, value) in args {
        let name = mapping.get(key).cloned().unwrap_or_else(|| key.clone());
        variables.insert(name, value.clone());
    }
    Value::Object(variables)
}

//! GraphQL request and response values.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A GraphQL operation to subscribe to.
///
/// Immutable once built: the builder methods consume `self`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Request {
    query: String,
    operation_name: Option<String>,
    variables: Map<String, Value>,
    headers: BTreeMap<String, String>,
}

impl Request {
    /// Create a request for `query` with no variables or headers.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    /// Name the operation to run when the document holds several.
    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    /// Bind one variable. Later bindings of the same name win.
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Replace all variable bindings.
    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    /// Add a header sent in the `connection_init` payload.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn operation_name(&self) -> Option<&str> {
        self.operation_name.as_deref()
    }

    /// Variable bindings in insertion order.
    pub fn variables(&self) -> &Map<String, Value> {
        &self.variables
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Body of the `start` frame: `{query, variables, operationName?}`.
    pub fn payload(&self) -> Value {
        let mut payload = Map::new();
        payload.insert("query".to_string(), Value::String(self.query.clone()));
        payload.insert("variables".to_string(), Value::Object(self.variables.clone()));
        if let Some(name) = &self.operation_name {
            payload.insert("operationName".to_string(), Value::String(name.clone()));
        }
        Value::Object(payload)
    }

    /// Headers as a JSON object, for the `connection_init` payload.
    pub fn headers_json(&self) -> Value {
        Value::Object(
            self.headers
                .iter()
                .map(|(name, value)| (name.clone(), Value::String(value.clone())))
                .collect(),
        )
    }
}

/// One error entry of a GraphQL response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<Location>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

/// Source location attached to a [`GraphQLError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub line: u32,
    pub column: u32,
}

/// Payload of a `data` or `error` frame, tied back to the request that
/// produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    request: Arc<Request>,
    json: Value,
}

impl Response {
    pub fn new(request: Arc<Request>, json: Value) -> Self {
        Self { request, json }
    }

    /// The request this response answers.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The raw payload body.
    pub fn json(&self) -> &Value {
        &self.json
    }

    /// The `data` member, if the body is an object carrying one.
    pub fn data(&self) -> Option<&Value> {
        self.json.get("data").filter(|data| !data.is_null())
    }

    /// The `errors` member, decoded leniently.
    ///
    /// Entries that are not well-formed error objects keep their JSON text
    /// as the message.
    pub fn errors(&self) -> Vec<GraphQLError> {
        let Some(Value::Array(entries)) = self.json.get("errors") else {
            return Vec::new();
        };

        entries
            .iter()
            .map(|entry| {
                serde_json::from_value(entry.clone()).unwrap_or_else(|_| GraphQLError {
                    message: entry.to_string(),
                    locations: None,
                    path: None,
                    extensions: None,
                })
            })
            .collect()
    }

    pub fn has_errors(&self) -> bool {
        matches!(self.json.get("errors"), Some(Value::Array(entries)) if !entries.is_empty())
    }

    pub fn into_json(self) -> Value {
        self.json
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_keeps_variable_order() {
        let request = Request::new("subscription { ticks(first: $first, after: $after) }")
            .with_variable("first", 10)
            .with_variable("after", "cursor-1")
            .with_operation_name("Ticks");

        let payload = request.payload();
        assert_eq!(payload["query"], json!(request.query()));
        assert_eq!(payload["operationName"], json!("Ticks"));

        let names: Vec<&String> = payload["variables"].as_object().unwrap().keys().collect();
        assert_eq!(names, vec!["first", "after"]);
    }

    #[test]
    fn test_payload_omits_missing_operation_name() {
        let payload = Request::new("subscription { ping }").payload();
        assert!(payload.get("operationName").is_none());
        assert_eq!(payload["variables"], json!({}));
    }

    #[test]
    fn test_headers_json() {
        let request = Request::new("subscription { ping }")
            .with_header("x-api-key", "secret")
            .with_header("Authorization", "Bearer abc");

        assert_eq!(
            request.headers_json(),
            json!({ "Authorization": "Bearer abc", "x-api-key": "secret" })
        );
    }

    #[test]
    fn test_response_data_and_errors() {
        let request = Arc::new(Request::new("subscription { foo }"));
        let response = Response::new(
            Arc::clone(&request),
            json!({
                "data": { "foo": 1 },
                "errors": [
                    { "message": "partial", "locations": [{ "line": 1, "column": 16 }], "path": ["foo"] },
                    "bare string"
                ]
            }),
        );

        assert_eq!(response.data(), Some(&json!({ "foo": 1 })));
        assert!(response.has_errors());

        let errors = response.errors();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].message, "partial");
        assert_eq!(errors[0].locations, Some(vec![Location { line: 1, column: 16 }]));
        assert_eq!(errors[1].message, "\"bare string\"");
        assert_eq!(response.request(), request.as_ref());
    }

    #[test]
    fn test_response_non_object_body() {
        let response = Response::new(Arc::new(Request::new("q")), json!("boom"));
        assert_eq!(response.json(), &json!("boom"));
        assert_eq!(response.data(), None);
        assert!(!response.has_errors());
        assert!(response.errors().is_empty());
    }
}

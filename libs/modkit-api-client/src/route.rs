//! Declarative route table types.
//!
//! A [`RouteTable`] is inert configuration: the client reads it once at
//! construction and builds one endpoint per entry.

use crate::error::ApiError;
use crate::payload::CachePolicy;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;

/// Method of a route: one of the buffered HTTP verbs, or a persistent transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    /// Persistent bidirectional socket, one connection per address
    #[serde(alias = "ws")]
    Websocket,
    /// One-way server-sent event stream, one endpoint per call
    Sse,
}

impl RouteMethod {
    /// Safe-read methods are the only ones eligible for response caching.
    #[must_use]
    pub fn is_safe_read(self) -> bool {
        matches!(self, RouteMethod::Get)
    }

    /// Whether a request body is sent for this method.
    #[must_use]
    pub fn permits_body(self) -> bool {
        matches!(
            self,
            RouteMethod::Post | RouteMethod::Put | RouteMethod::Patch | RouteMethod::Delete
        )
    }

    /// HTTP verb for buffered routes; `None` for socket and stream routes.
    #[must_use]
    pub fn http_method(self) -> Option<http::Method> {
        match self {
            RouteMethod::Get => Some(http::Method::GET),
            RouteMethod::Post => Some(http::Method::POST),
            RouteMethod::Put => Some(http::Method::PUT),
            RouteMethod::Patch => Some(http::Method::PATCH),
            RouteMethod::Delete => Some(http::Method::DELETE),
            RouteMethod::Websocket | RouteMethod::Sse => None,
        }
    }
}

impl fmt::Display for RouteMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RouteMethod::Get => "get",
            RouteMethod::Post => "post",
            RouteMethod::Put => "put",
            RouteMethod::Patch => "patch",
            RouteMethod::Delete => "delete",
            RouteMethod::Websocket => "websocket",
            RouteMethod::Sse => "sse",
        };
        f.write_str(name)
    }
}

/// Static declaration of one API endpoint.
///
/// `path` is a URL template where `:name` segments are replaced by call
/// params. `invalidates` lists cache-key patterns cleared after a successful
/// call. Schema hints (`body`, `query`, `params` shapes) are accepted and
/// ignored; they carry no runtime behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteDescriptor {
    pub path: String,
    pub method: RouteMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub invalidates: Vec<String>,
    /// Route-level cache policy; a call-level policy takes precedence.
    #[serde(default)]
    pub cache: Option<CachePolicy>,
    #[serde(default, rename = "body")]
    _body: Option<serde_json::Value>,
    #[serde(default, rename = "query")]
    _query: Option<serde_json::Value>,
    #[serde(default, rename = "params")]
    _params: Option<serde_json::Value>,
}

impl RouteDescriptor {
    #[must_use]
    pub fn new(method: RouteMethod, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method,
            headers: BTreeMap::new(),
            invalidates: Vec::new(),
            cache: None,
            _body: None,
            _query: None,
            _params: None,
        }
    }

    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(RouteMethod::Get, path)
    }

    #[must_use]
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(RouteMethod::Post, path)
    }

    #[must_use]
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(RouteMethod::Put, path)
    }

    #[must_use]
    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(RouteMethod::Patch, path)
    }

    #[must_use]
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(RouteMethod::Delete, path)
    }

    #[must_use]
    pub fn websocket(path: impl Into<String>) -> Self {
        Self::new(RouteMethod::Websocket, path)
    }

    #[must_use]
    pub fn sse(path: impl Into<String>) -> Self {
        Self::new(RouteMethod::Sse, path)
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn invalidates<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invalidates.extend(patterns.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn cache(mut self, policy: CachePolicy) -> Self {
        self.cache = Some(policy);
        self
    }
}

/// Mapping from route name to descriptor.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct RouteTable {
    routes: BTreeMap<String, RouteDescriptor>,
}

impl RouteTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route, replacing any previous route with the same name.
    #[must_use]
    pub fn route(mut self, name: impl Into<String>, descriptor: RouteDescriptor) -> Self {
        self.routes.insert(name.into(), descriptor);
        self
    }

    /// Parse a route table from its JSON form.
    ///
    /// # Errors
    /// Returns `ApiError::Configuration` if the document is not a JSON object
    /// of route descriptors.
    pub fn from_json_str(json: &str) -> Result<Self, ApiError> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| ApiError::configuration(format!("route table is not valid JSON: {e}")))?;
        Self::from_value(value)
    }

    /// Build a route table from an already-parsed JSON value.
    ///
    /// # Errors
    /// Returns `ApiError::Configuration` if `value` is not an object or an
    /// entry is not a valid route descriptor.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ApiError> {
        if !value.is_object() {
            return Err(ApiError::configuration("route table must be an object"));
        }
        serde_json::from_value(value)
            .map_err(|e| ApiError::configuration(format!("invalid route table: {e}")))
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&RouteDescriptor> {
        self.routes.get(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    #[must_use]
    pub fn iter(&self) -> impl Iterator<Item = (&str, &RouteDescriptor)> {
        self.routes.iter().map(|(name, route)| (name.as_str(), route))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_method_classes() {
        assert!(RouteMethod::Get.is_safe_read());
        assert!(!RouteMethod::Post.is_safe_read());
        assert!(!RouteMethod::Get.permits_body());
        assert!(RouteMethod::Delete.permits_body());
        assert_eq!(RouteMethod::Patch.http_method(), Some(http::Method::PATCH));
        assert_eq!(RouteMethod::Sse.http_method(), None);
    }

    #[test]
    fn test_from_json_str() {
        let table = RouteTable::from_json_str(
            r#"{
                "getUsers": { "path": "/users", "method": "get", "cache": { "ttl": "5s" } },
                "createUser": {
                    "path": "/users",
                    "method": "post",
                    "invalidates": ["/users"],
                    "body": { "name": "string" }
                },
                "chat": { "path": "/chat", "method": "websocket" },
                "events": { "path": "/events/:room", "method": "sse" }
            }"#,
        )
        .unwrap();

        assert_eq!(table.len(), 4);
        let get_users = table.get("getUsers").unwrap();
        assert_eq!(get_users.method, RouteMethod::Get);
        let policy = get_users.cache.clone().unwrap();
        assert_eq!(policy.options().unwrap().ttl, Some(Duration::from_secs(5)));

        let create = table.get("createUser").unwrap();
        assert_eq!(create.invalidates, vec!["/users".to_owned()]);
        assert_eq!(table.get("chat").unwrap().method, RouteMethod::Websocket);
    }

    #[test]
    fn test_rejects_non_object() {
        let err = RouteTable::from_value(json!(["getUsers"])).unwrap_err();
        assert!(matches!(err, ApiError::Configuration { .. }));

        let err = RouteTable::from_json_str("not json").unwrap_err();
        assert!(matches!(err, ApiError::Configuration { .. }));
    }

    #[test]
    fn test_rejects_unknown_method() {
        let err = RouteTable::from_value(json!({
            "x": { "path": "/x", "method": "head" }
        }))
        .unwrap_err();
        assert!(err.to_string().contains("invalid route table"));
    }

    #[test]
    fn test_builder_api() {
        let table = RouteTable::new()
            .route("getUser", RouteDescriptor::get("/users/:id"))
            .route(
                "deleteUser",
                RouteDescriptor::delete("/users/:id")
                    .header("x-audit", "1")
                    .invalidates(["/users*"]),
            );

        let names: Vec<_> = table.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["deleteUser", "getUser"]);
        assert_eq!(table.get("deleteUser").unwrap().headers["x-audit"], "1");
    }
}

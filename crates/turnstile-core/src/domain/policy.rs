//! Route policy: static admission rules for one registered endpoint.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// HTTP methods a route may accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// Immutable per-route policy.
///
/// Created once at registration time. `accepted_content_types` empty means
/// "any content type"; otherwise the declared type must match one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePolicy {
    pub path: String,
    pub methods: Vec<HttpMethod>,
    pub max_concurrent_requests: usize,
    pub accepted_content_types: Vec<String>,
    /// Maximum body length in bytes.
    pub max_content_length: Option<u64>,
    pub trace_name: Option<String>,
    pub timeout: Option<Duration>,
}

impl RoutePolicy {
    pub fn new(path: impl Into<String>, max_concurrent_requests: usize) -> Self {
        Self {
            path: path.into(),
            methods: vec![HttpMethod::Post],
            max_concurrent_requests,
            accepted_content_types: Vec::new(),
            max_content_length: None,
            trace_name: None,
            timeout: None,
        }
    }

    pub fn methods(mut self, methods: &[HttpMethod]) -> Self {
        self.methods = methods.to_vec();
        self
    }

    /// Require a single content type.
    pub fn content_type(self, content_type: &str) -> Self {
        self.content_types(&[content_type])
    }

    pub fn content_types(mut self, content_types: &[&str]) -> Self {
        self.accepted_content_types = content_types
            .iter()
            .map(|ct| media_type(ct).to_ascii_lowercase())
            .collect();
        self
    }

    pub fn max_content_length(mut self, bytes: u64) -> Self {
        self.max_content_length = Some(bytes);
        self
    }

    pub fn trace_name(mut self, name: impl Into<String>) -> Self {
        self.trace_name = Some(name.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn allows_method(&self, method: HttpMethod) -> bool {
        self.methods.contains(&method)
    }

    /// Does the declared content type satisfy this policy?
    ///
    /// Parameters (`; charset=...`) are ignored and the comparison is
    /// ASCII case-insensitive. A missing header only passes when the route
    /// accepts anything.
    pub fn accepts_content_type(&self, declared: Option<&str>) -> bool {
        if self.accepted_content_types.is_empty() {
            return true;
        }
        let Some(declared) = declared else {
            return false;
        };
        let declared = media_type(declared);
        self.accepted_content_types
            .iter()
            .any(|accepted| accepted.eq_ignore_ascii_case(declared))
    }

    /// Span name for dispatch; falls back to the path.
    pub fn span_name(&self) -> &str {
        self.trace_name.as_deref().unwrap_or(&self.path)
    }
}

fn media_type(content_type: &str) -> &str {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
}

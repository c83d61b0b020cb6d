//! Request and response envelopes.
//!
//! An envelope is the immutable record that carries a request (or its
//! response) across every internal boundary: ingress, the queue fabric, the
//! route manager, and the hook orchestrator. Envelopes are frozen once
//! published; a transformation produces a new envelope via
//! [`RequestEnvelope::to_builder`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Instant;

/// HTTP method, wire-stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        }
    }
}

impl std::str::FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "PATCH" => Ok(Method::Patch),
            "HEAD" => Ok(Method::Head),
            "OPTIONS" => Ok(Method::Options),
            other => Err(format!("unsupported method '{other}'")),
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Case-insensitive header map. Keys are stored lowercased; lookup accepts
/// any casing. Insertion order is not significant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers {
    entries: std::collections::BTreeMap<String, String>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.entries
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: impl AsRef<str>) -> Option<&str> {
        self.entries
            .get(&name.as_ref().to_ascii_lowercase())
            .map(|v| v.as_str())
    }

    pub fn contains(&self, name: impl AsRef<str>) -> bool {
        self.entries.contains_key(&name.as_ref().to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Request priority, 1 = highest through 10 = lowest. Out-of-range values
/// clamp; the default is the middle of the range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(1);
    pub const LOWEST: Priority = Priority(10);

    pub fn new(value: u8) -> Self {
        Priority(value.clamp(1, 10))
    }

    /// Parse from a header value, clamping; `None` on non-numeric input.
    pub fn parse(s: &str) -> Option<Self> {
        s.trim().parse::<i64>().ok().map(|n| Priority(n.clamp(1, 10) as u8))
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    /// Zero-based ring index for the fabric's priority queues.
    pub fn class_index(&self) -> usize {
        (self.0 - 1) as usize
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority(5)
    }
}

/// How the client asked for a handler version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum VersionPreference {
    /// No preference: latest active version.
    Latest,
    /// A direct version identifier or semantic tag. Resolution tries the
    /// identifier first, then the tag.
    Named(String),
    /// Newest version created at or before this instant.
    Timestamp(DateTime<Utc>),
}

impl VersionPreference {
    /// Parse a preference from the `version` query key or the
    /// `X-Gati-Version` header. An ISO-8601 timestamp is recognized first;
    /// anything else is a name (tag or id).
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return VersionPreference::Latest;
        }
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return VersionPreference::Timestamp(ts.with_timezone(&Utc));
        }
        VersionPreference::Named(raw.to_string())
    }

    pub fn is_latest(&self) -> bool {
        matches!(self, VersionPreference::Latest)
    }
}

impl Default for VersionPreference {
    fn default() -> Self {
        VersionPreference::Latest
    }
}

/// Opaque auth context produced by ingress admission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthContext {
    /// The admission method that produced this context
    /// (`none`, `api_key`, `bearer`).
    pub method: String,
    /// Authenticated principal, if the method yields one.
    pub principal: Option<String>,
    /// Roles granted to the principal, consulted by route policies.
    pub roles: Vec<String>,
    /// Raw claims from the validator, opaque to the core.
    pub claims: serde_json::Value,
}

impl AuthContext {
    pub fn anonymous() -> Self {
        AuthContext {
            method: "none".to_string(),
            principal: None,
            roles: Vec::new(),
            claims: serde_json::Value::Null,
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

fn instant_now() -> Instant {
    Instant::now()
}

/// The immutable record of one inbound request.
///
/// Constructed by ingress admission and published to the routing topic.
/// All downstream components treat it as read-only; transformed variants
/// are built with [`to_builder`](Self::to_builder).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Unique, opaque, stable for the request's lifetime.
    pub request_id: String,
    pub trace_id: String,
    pub client_id: String,
    pub method: Method,
    /// Normalized: leading slash, no `.`/`..` segments, trailing slash
    /// trimmed except for the root.
    pub path: String,
    pub headers: Headers,
    /// Wall-clock receipt time.
    pub received_at: DateTime<Utc>,
    /// Monotonic receipt time, for deadline arithmetic. Not serialized;
    /// deserialized envelopes restart the clock at decode time.
    #[serde(skip, default = "instant_now")]
    pub received_mono: Instant,
    pub body: Option<serde_json::Value>,
    pub client_ip: Option<String>,
    pub version: VersionPreference,
    pub priority: Priority,
    pub flags: BTreeSet<String>,
    pub auth: AuthContext,
}

impl RequestEnvelope {
    pub fn builder(method: Method, path: impl Into<String>) -> RequestEnvelopeBuilder {
        RequestEnvelopeBuilder::new(method, path)
    }

    /// Clone this envelope into a builder; the only way to "modify" a
    /// published envelope.
    pub fn to_builder(&self) -> RequestEnvelopeBuilder {
        RequestEnvelopeBuilder {
            envelope: self.clone(),
        }
    }

    /// Remaining budget against the given total request deadline.
    pub fn remaining_budget(&self, total: std::time::Duration) -> std::time::Duration {
        total.saturating_sub(self.received_mono.elapsed())
    }
}

/// Builder producing a fresh [`RequestEnvelope`].
pub struct RequestEnvelopeBuilder {
    envelope: RequestEnvelope,
}

impl RequestEnvelopeBuilder {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        RequestEnvelopeBuilder {
            envelope: RequestEnvelope {
                request_id: uuid::Uuid::new_v4().to_string(),
                trace_id: uuid::Uuid::new_v4().to_string(),
                client_id: String::new(),
                method,
                path: normalize_path(&path.into()),
                headers: Headers::new(),
                received_at: Utc::now(),
                received_mono: Instant::now(),
                body: None,
                client_ip: None,
                version: VersionPreference::Latest,
                priority: Priority::default(),
                flags: BTreeSet::new(),
                auth: AuthContext::anonymous(),
            },
        }
    }

    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.envelope.request_id = id.into();
        self
    }

    pub fn trace_id(mut self, id: impl Into<String>) -> Self {
        self.envelope.trace_id = id.into();
        self
    }

    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.envelope.client_id = id.into();
        self
    }

    pub fn header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.envelope.headers.insert(name, value);
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.envelope.headers = headers;
        self
    }

    pub fn body(mut self, body: serde_json::Value) -> Self {
        self.envelope.body = Some(body);
        self
    }

    pub fn client_ip(mut self, ip: impl Into<String>) -> Self {
        self.envelope.client_ip = Some(ip.into());
        self
    }

    pub fn version(mut self, preference: VersionPreference) -> Self {
        self.envelope.version = preference;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.envelope.priority = priority;
        self
    }

    pub fn flag(mut self, flag: impl Into<String>) -> Self {
        self.envelope.flags.insert(flag.into());
        self
    }

    pub fn auth(mut self, auth: AuthContext) -> Self {
        self.envelope.auth = auth;
        self
    }

    pub fn build(self) -> RequestEnvelope {
        self.envelope
    }
}

/// The terminal record of one request. At most one per request id;
/// duplicates are dropped by the fabric's result correlation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub request_id: String,
    pub status: u16,
    pub produced_at: DateTime<Utc>,
    pub headers: Headers,
    pub body: Option<serde_json::Value>,
    /// Non-fatal warnings accumulated along the way (e.g. ignored double
    /// terminal calls on the response builder).
    pub warnings: Vec<String>,
}

impl ResponseEnvelope {
    pub fn new(request_id: impl Into<String>, status: u16) -> Self {
        ResponseEnvelope {
            request_id: request_id.into(),
            status,
            produced_at: Utc::now(),
            headers: Headers::new(),
            body: None,
            warnings: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// Normalize a request path: leading slash, duplicate slashes collapsed,
/// `.` segments dropped, `..` segments resolved against their parent, and
/// the trailing slash trimmed (except for the root itself).
pub fn normalize_path(raw: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return "/".to_string();
    }
    let mut out = String::new();
    for segment in segments {
        out.push('/');
        out.push_str(segment);
    }
    out
}

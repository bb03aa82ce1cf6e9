//! Request identity

use super::headers::Headers;

/// Identity of a request for lookup purposes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestKey {
    pub origin: String,
    pub method: String,
    /// May carry a query string.
    pub path: String,
    /// Only consulted for `Vary` matching.
    pub headers: Option<Headers>,
    /// Caller-supplied entry id; the store mints a UUID at first write
    /// otherwise.
    pub id: Option<String>,
}

impl RequestKey {
    pub fn new(
        origin: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            origin: origin.into(),
            method: method.into(),
            path: path.into(),
            headers: None,
            id: None,
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// First-level lookup fingerprint: `enc(origin):enc(path):method`.
    pub fn shape(&self) -> String {
        format!("{}{}", self.shape_prefix(), self.method)
    }

    /// Fingerprint prefix shared by every method at this origin and path:
    /// `enc(origin):enc(path):`.
    pub fn shape_prefix(&self) -> String {
        format!(
            "{}:{}:",
            urlencoding::encode(&self.origin),
            urlencoding::encode(&self.path)
        )
    }
}

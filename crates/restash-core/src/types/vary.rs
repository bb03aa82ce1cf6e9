//! Vary fingerprint matching

use std::collections::HashMap;

use super::headers::{header_get, Headers};

/// Vary fingerprint recorded per entry: header name → required value, or
/// `None` for "this header must be absent on the request".
pub type Vary = HashMap<String, Option<String>>;

/// Check a request's headers against a stored vary fingerprint.
///
/// An unset request header and an explicit null requirement are equivalent:
/// a `None` requirement matches exactly when the header is not present.
pub fn vary_matches(vary: &Vary, headers: Option<&Headers>) -> bool {
    vary.iter().all(|(name, required)| {
        let actual = headers.and_then(|headers| header_get(headers, name));
        match (required, actual) {
            (None, None) => true,
            (None, Some(_)) => false,
            (Some(_), None) => false,
            (Some(required), Some(actual)) => actual.joined() == *required,
        }
    })
}

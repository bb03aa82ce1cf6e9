//! Header map with single-or-repeated values

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single header value or a repeated header's value list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Single(String),
    Multi(Vec<String>),
}

impl HeaderValue {
    /// Flatten to one comparable string; repeated values join with `", "`.
    pub fn joined(&self) -> String {
        match self {
            HeaderValue::Single(value) => value.clone(),
            HeaderValue::Multi(values) => values.join(", "),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Single(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Single(value)
    }
}

impl From<Vec<String>> for HeaderValue {
    fn from(values: Vec<String>) -> Self {
        HeaderValue::Multi(values)
    }
}

/// Header name → value mapping. Names are matched case-insensitively on
/// lookup, so callers may insert them in any casing.
pub type Headers = HashMap<String, HeaderValue>;

/// Case-insensitive header lookup.
pub fn header_get<'a>(headers: &'a Headers, name: &str) -> Option<&'a HeaderValue> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
}

/// Pull the cache tags out of a response's configured tags header:
/// comma-separated within a value, one or more values.
pub fn extract_cache_tags(headers: &Headers, header_name: &str) -> Vec<String> {
    let Some(value) = header_get(headers, header_name) else {
        return Vec::new();
    };
    let split = |value: &str| {
        value
            .split(',')
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(String::from)
            .collect::<Vec<_>>()
    };
    match value {
        HeaderValue::Single(value) => split(value),
        HeaderValue::Multi(values) => values.iter().flat_map(|value| split(value)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, HeaderValue)]) -> Headers {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn test_header_get_is_case_insensitive() {
        let headers = headers(&[("Cache-Tag", "products".into())]);
        assert!(header_get(&headers, "cache-tag").is_some());
        assert!(header_get(&headers, "CACHE-TAG").is_some());
        assert!(header_get(&headers, "etag").is_none());
    }

    #[test]
    fn test_joined_flattens_repeated_values() {
        let value: HeaderValue = vec!["a".to_string(), "b".to_string()].into();
        assert_eq!(value.joined(), "a, b");
    }

    #[test]
    fn test_extract_cache_tags_splits_and_trims() {
        let headers = headers(&[("cache-tag", " a, b ,, c".into())]);
        assert_eq!(extract_cache_tags(&headers, "cache-tag"), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_extract_cache_tags_from_repeated_header() {
        let headers = headers(&[(
            "cache-tag",
            vec!["a,b".to_string(), "c".to_string()].into(),
        )]);
        assert_eq!(extract_cache_tags(&headers, "cache-tag"), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_extract_cache_tags_missing_header() {
        let headers = Headers::new();
        assert!(extract_cache_tags(&headers, "cache-tag").is_empty());
    }

    #[test]
    fn test_header_value_untagged_serde() {
        let single: HeaderValue = serde_json::from_str("\"x\"").unwrap();
        assert_eq!(single, HeaderValue::Single("x".into()));

        let multi: HeaderValue = serde_json::from_str("[\"x\",\"y\"]").unwrap();
        assert_eq!(multi, HeaderValue::Multi(vec!["x".into(), "y".into()]));
    }
}

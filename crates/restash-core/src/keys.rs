//! Deterministic serialization and parsing of the four backend key families.
//!
//! Every backend key has the shape `{key_prefix}{discriminator}{payload}`.
//! The prefix is caller-configured and may be empty. `origin`, `path` and
//! tag values are percent-encoded so `:` stays an unambiguous separator; the
//! encoding also keeps glob metacharacters (`*?[]`) out of scan patterns,
//! whether they arrive in a URL or in a `Cache-Tag` value. Parsing splits
//! around the first occurrence of a family discriminator and returns the
//! portion before it as `key_prefix`, which lets an observer work with keys
//! from any prefix.

use crate::error::{CacheError, Result};

/// Discriminator of the per-shape pointer rows.
pub const METADATA: &str = "metadata:";
/// Discriminator of the id reverse-lookup rows.
pub const IDS: &str = "ids:";
/// Discriminator of the payload rows.
pub const VALUES: &str = "values:";
/// Discriminator of the tag membership rows.
pub const CACHE_TAGS: &str = "cache-tags:";

/// The four key families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    Metadata,
    Ids,
    Values,
    CacheTags,
}

/// Classify a backend key by the family discriminator that occurs first.
pub fn family_of(key: &str) -> Option<KeyFamily> {
    [
        (key.find(METADATA), KeyFamily::Metadata),
        (key.find(IDS), KeyFamily::Ids),
        (key.find(VALUES), KeyFamily::Values),
        (key.find(CACHE_TAGS), KeyFamily::CacheTags),
    ]
    .into_iter()
    .filter_map(|(at, family)| at.map(|at| (at, family)))
    .min_by_key(|(at, _)| *at)
    .map(|(_, family)| family)
}

/// Parsed `metadata:{origin}:{path}:{method}:{id}` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMetadataKey {
    pub key_prefix: String,
    pub origin: String,
    pub path: String,
    pub method: String,
    pub id: String,
}

/// Parsed `ids:{id}` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedIdsKey {
    pub key_prefix: String,
    pub id: String,
}

/// Parsed `values:{id}` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedValuesKey {
    pub key_prefix: String,
    pub id: String,
}

/// Parsed `cache-tags:{tag}:..:{id}` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTagsKey {
    pub key_prefix: String,
    pub tags: Vec<String>,
    pub id: String,
}

/// Serialize a metadata key. Injective on the full tuple.
pub fn serialize_metadata_key(
    key_prefix: &str,
    origin: &str,
    path: &str,
    method: &str,
    id: &str,
) -> String {
    format!(
        "{key_prefix}{METADATA}{}:{}:{method}:{id}",
        urlencoding::encode(origin),
        urlencoding::encode(path)
    )
}

/// Serialize an ids key.
pub fn serialize_ids_key(key_prefix: &str, id: &str) -> String {
    format!("{key_prefix}{IDS}{id}")
}

/// Serialize a values key.
pub fn serialize_values_key(key_prefix: &str, id: &str) -> String {
    format!("{key_prefix}{VALUES}{id}")
}

/// Serialize a cache-tags key. Tags are percent-encoded, then stored
/// lexicographically sorted so superset scans can interleave them with
/// wildcards.
pub fn serialize_tags_key(key_prefix: &str, tags: &[String], id: &str) -> String {
    format!(
        "{key_prefix}{CACHE_TAGS}{}:{id}",
        encode_sorted_tags(tags).join(":")
    )
}

fn encode_sorted_tags(tags: &[String]) -> Vec<String> {
    let mut encoded: Vec<String> = tags
        .iter()
        .map(|tag| urlencoding::encode(tag).into_owned())
        .collect();
    encoded.sort();
    encoded
}

fn split_at_discriminator<'a>(key: &'a str, discriminator: &str) -> Result<(&'a str, &'a str)> {
    match key.find(discriminator) {
        Some(at) => Ok((&key[..at], &key[at + discriminator.len()..])),
        None => Err(CacheError::InvalidKey(key.to_string())),
    }
}

fn decode_segment(segment: &str, key: &str) -> Result<String> {
    urlencoding::decode(segment)
        .map(|decoded| decoded.into_owned())
        .map_err(|_| CacheError::InvalidKey(key.to_string()))
}

/// Parse a metadata key with an arbitrary (possibly empty) prefix.
pub fn parse_metadata_key(key: &str) -> Result<ParsedMetadataKey> {
    let (key_prefix, rest) = split_at_discriminator(key, METADATA)?;
    let mut segments = rest.splitn(4, ':');
    let origin = segments.next();
    let path = segments.next();
    let method = segments.next();
    let id = segments.next();
    match (origin, path, method, id) {
        (Some(origin), Some(path), Some(method), Some(id)) if !method.is_empty() && !id.is_empty() => {
            Ok(ParsedMetadataKey {
                key_prefix: key_prefix.to_string(),
                origin: decode_segment(origin, key)?,
                path: decode_segment(path, key)?,
                method: method.to_string(),
                id: id.to_string(),
            })
        }
        _ => Err(CacheError::InvalidKey(key.to_string())),
    }
}

/// Parse an ids key with an arbitrary prefix.
pub fn parse_ids_key(key: &str) -> Result<ParsedIdsKey> {
    let (key_prefix, id) = split_at_discriminator(key, IDS)?;
    if id.is_empty() {
        return Err(CacheError::InvalidKey(key.to_string()));
    }
    Ok(ParsedIdsKey {
        key_prefix: key_prefix.to_string(),
        id: id.to_string(),
    })
}

/// Parse a values key with an arbitrary prefix.
pub fn parse_values_key(key: &str) -> Result<ParsedValuesKey> {
    let (key_prefix, id) = split_at_discriminator(key, VALUES)?;
    if id.is_empty() {
        return Err(CacheError::InvalidKey(key.to_string()));
    }
    Ok(ParsedValuesKey {
        key_prefix: key_prefix.to_string(),
        id: id.to_string(),
    })
}

/// Parse a cache-tags key with an arbitrary prefix. The final segment is the
/// entry id, everything before it is the sorted tag set, decoded back to the
/// raw tag values.
pub fn parse_tags_key(key: &str) -> Result<ParsedTagsKey> {
    let (key_prefix, rest) = split_at_discriminator(key, CACHE_TAGS)?;
    let mut segments: Vec<&str> = rest.split(':').collect();
    if segments.len() < 2 {
        return Err(CacheError::InvalidKey(key.to_string()));
    }
    let id = segments.pop().unwrap_or_default();
    if id.is_empty() || segments.iter().any(|segment| segment.is_empty()) {
        return Err(CacheError::InvalidKey(key.to_string()));
    }
    let mut tags = Vec::with_capacity(segments.len());
    for segment in segments {
        tags.push(decode_segment(segment, key)?);
    }
    Ok(ParsedTagsKey {
        key_prefix: key_prefix.to_string(),
        tags,
        id: id.to_string(),
    })
}

/// Prepend `key_prefix` unless the key already carries it. Used when a key
/// serialized without a prefix is handed to a backend operation that needs
/// absolute keys.
pub fn add_key_prefix(key: &str, key_prefix: &str) -> String {
    if key_prefix.is_empty() || key.starts_with(key_prefix) {
        key.to_string()
    } else {
        format!("{key_prefix}{key}")
    }
}

/// Scan pattern for every metadata row of one request shape. Pass `"*"` as
/// `method` to match any method at the same origin and path.
pub fn metadata_pattern(key_prefix: &str, origin: &str, path: &str, method: &str) -> String {
    format!(
        "{key_prefix}{METADATA}{}:{}:{method}:*",
        urlencoding::encode(origin),
        urlencoding::encode(path)
    )
}

/// Scan pattern for every ids row under one prefix.
pub fn ids_pattern(key_prefix: &str) -> String {
    format!("{key_prefix}{IDS}*")
}

/// Scan pattern matching every cache-tags row whose tag set is a superset of
/// `tags`: the tags are percent-encoded exactly as `serialize_tags_key`
/// stores them, sorted, and interleaved with wildcards. In global mode the
/// pattern starts with `*` so it crosses key prefixes.
pub fn tags_pattern(key_prefix: &str, tags: &[String], global: bool) -> String {
    let mut pattern = String::new();
    if global {
        pattern.push('*');
    } else {
        pattern.push_str(key_prefix);
    }
    pattern.push_str(CACHE_TAGS);
    for tag in &encode_sorted_tags(tags) {
        pattern.push('*');
        pattern.push_str(tag);
        pattern.push('*');
        pattern.push(':');
    }
    pattern.push('*');
    pattern
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_metadata_round_trip() {
        let key = serialize_metadata_key(
            "app:",
            "http://example.com:8080",
            "/a/b?q=1",
            "GET",
            "id-1",
        );
        let parsed = parse_metadata_key(&key).unwrap();
        assert_eq!(parsed.key_prefix, "app:");
        assert_eq!(parsed.origin, "http://example.com:8080");
        assert_eq!(parsed.path, "/a/b?q=1");
        assert_eq!(parsed.method, "GET");
        assert_eq!(parsed.id, "id-1");
    }

    #[test]
    fn test_metadata_empty_prefix() {
        let key = serialize_metadata_key("", "http://h", "/", "HEAD", "x");
        assert!(key.starts_with(METADATA));
        let parsed = parse_metadata_key(&key).unwrap();
        assert_eq!(parsed.key_prefix, "");
        assert_eq!(parsed.method, "HEAD");
    }

    #[test]
    fn test_encoding_keeps_separator_unambiguous() {
        let key = serialize_metadata_key("", "a:b", "c:d", "GET", "id");
        // the only raw colons left are the three separators plus the ones
        // around the discriminator
        let parsed = parse_metadata_key(&key).unwrap();
        assert_eq!(parsed.origin, "a:b");
        assert_eq!(parsed.path, "c:d");
    }

    #[test]
    fn test_encoding_escapes_glob_metacharacters() {
        let key = serialize_metadata_key("", "http://h", "/p/*?[x]", "GET", "id");
        let (_, rest) = key.split_once(METADATA).unwrap();
        let payload = rest.rsplitn(3, ':').nth(2).unwrap();
        assert!(!payload.contains('*'));
        assert!(!payload.contains('?'));
        assert!(!payload.contains('['));
    }

    #[test]
    fn test_ids_and_values_round_trip() {
        let ids = serialize_ids_key("p:", "abc");
        assert_eq!(
            parse_ids_key(&ids).unwrap(),
            ParsedIdsKey {
                key_prefix: "p:".into(),
                id: "abc".into()
            }
        );

        let values = serialize_values_key("p:", "abc");
        assert_eq!(
            parse_values_key(&values).unwrap(),
            ParsedValuesKey {
                key_prefix: "p:".into(),
                id: "abc".into()
            }
        );
    }

    #[test]
    fn test_tags_key_sorts_tags() {
        let key = serialize_tags_key("", &["b".into(), "a".into(), "c".into()], "id");
        assert_eq!(key, "cache-tags:a:b:c:id");
        let parsed = parse_tags_key(&key).unwrap();
        assert_eq!(parsed.tags, vec!["a", "b", "c"]);
        assert_eq!(parsed.id, "id");
    }

    #[test]
    fn test_tags_with_reserved_characters_round_trip() {
        let tags = vec!["scope:orders".to_string(), "a*b".to_string()];
        let key = serialize_tags_key("p:", &tags, "id");
        let parsed = parse_tags_key(&key).unwrap();
        let mut got = parsed.tags;
        got.sort();
        assert_eq!(got, vec!["a*b".to_string(), "scope:orders".to_string()]);
        assert_eq!(parsed.id, "id");

        // neither the tag's colon nor its glob metacharacter leaks raw
        let (_, rest) = key.split_once(CACHE_TAGS).unwrap();
        assert_eq!(rest.split(':').count(), 3);
        assert!(!rest.contains('*'));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_metadata_key("not-a-key").is_err());
        assert!(parse_metadata_key("metadata:only:two:parts").is_err());
        assert!(parse_ids_key("ids:").is_err());
        assert!(parse_tags_key("cache-tags:lonely").is_err());
        assert!(parse_tags_key("cache-tags::id").is_err());
    }

    #[test]
    fn test_family_of_picks_first_discriminator() {
        assert_eq!(family_of("app:metadata:a:b:GET:x"), Some(KeyFamily::Metadata));
        assert_eq!(family_of("ids:x"), Some(KeyFamily::Ids));
        assert_eq!(family_of("p:values:x"), Some(KeyFamily::Values));
        assert_eq!(family_of("cache-tags:a:x"), Some(KeyFamily::CacheTags));
        assert_eq!(family_of("unrelated"), None);
    }

    #[test]
    fn test_add_key_prefix() {
        assert_eq!(add_key_prefix("ids:x", "p:"), "p:ids:x");
        assert_eq!(add_key_prefix("p:ids:x", "p:"), "p:ids:x");
        assert_eq!(add_key_prefix("ids:x", ""), "ids:x");
    }

    #[test]
    fn test_metadata_pattern_wildcards_method_and_id() {
        let pattern = metadata_pattern("p:", "http://h", "/foo", "*");
        assert_eq!(pattern, format!("p:{METADATA}http%3A%2F%2Fh:%2Ffoo:*:*"));
    }

    #[test]
    fn test_tags_pattern_shape() {
        let pattern = tags_pattern("p:", &["b".into(), "a".into()], false);
        assert_eq!(pattern, "p:cache-tags:*a*:*b*:*");

        let global = tags_pattern("p:", &["t".into()], true);
        assert_eq!(global, "*cache-tags:*t*:*");
    }

    #[test]
    fn test_tags_pattern_escapes_glob_metacharacters() {
        let pattern = tags_pattern("", &["a*b".into()], false);
        assert_eq!(pattern, "cache-tags:*a%2Ab*:*");
    }

    proptest! {
        #[test]
        fn prop_metadata_round_trip(
            key_prefix in "[x-z0-9]{0,6}",
            origin in ".{0,24}",
            path in ".{0,24}",
            method in "[A-Z]{1,8}",
            id in "[a-f0-9-]{1,36}",
        ) {
            let key = serialize_metadata_key(&key_prefix, &origin, &path, &method, &id);
            let parsed = parse_metadata_key(&key).unwrap();
            prop_assert_eq!(parsed.key_prefix, key_prefix);
            prop_assert_eq!(parsed.origin, origin);
            prop_assert_eq!(parsed.path, path);
            prop_assert_eq!(parsed.method, method);
            prop_assert_eq!(parsed.id, id);
        }

        #[test]
        fn prop_tags_round_trip(
            tags in proptest::collection::vec(".{1,12}", 1..4),
            id in "[a-f0-9-]{1,36}",
        ) {
            let key = serialize_tags_key("", &tags, &id);
            let parsed = parse_tags_key(&key).unwrap();
            // the key stores tags sorted by encoded form; compare as sets
            let mut got = parsed.tags;
            got.sort();
            let mut expected = tags.clone();
            expected.sort();
            prop_assert_eq!(got, expected);
            prop_assert_eq!(parsed.id, id);
        }
    }
}

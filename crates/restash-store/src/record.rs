//! The metadata hash row

use std::collections::HashMap;

use restash_core::{CacheError, Result, Vary};

pub(crate) const F_ID_KEY: &str = "idKey";
pub(crate) const F_VALUE_KEY: &str = "valueKey";
pub(crate) const F_TAGS_KEY: &str = "tagsKey";
pub(crate) const F_VARY: &str = "vary";
pub(crate) const F_METADATA_KEY: &str = "metadataKey";

/// Pointer record for one request shape + vary fingerprint. Sibling keys are
/// stored without the key prefix; `keys::add_key_prefix` makes them absolute
/// before they hit the wire.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MetadataRecord {
    pub id_key: String,
    pub value_key: String,
    pub tags_key: Option<String>,
    pub vary: Option<Vary>,
}

impl MetadataRecord {
    /// Decode an HGETALL result. A missing pointer field or an undecodable
    /// vary document makes the whole row undecodable; callers tombstone it.
    pub(crate) fn from_hash(hash: &HashMap<String, String>) -> Result<Self> {
        let id_key = hash
            .get(F_ID_KEY)
            .cloned()
            .ok_or_else(|| CacheError::Deserialization("metadata row missing idKey".into()))?;
        let value_key = hash
            .get(F_VALUE_KEY)
            .cloned()
            .ok_or_else(|| CacheError::Deserialization("metadata row missing valueKey".into()))?;
        let vary = match hash.get(F_VARY) {
            Some(raw) => Some(
                serde_json::from_str(raw)
                    .map_err(|error| CacheError::Deserialization(format!("vary: {error}")))?,
            ),
            None => None,
        };
        Ok(Self {
            id_key,
            value_key,
            tags_key: hash.get(F_TAGS_KEY).cloned(),
            vary,
        })
    }

    /// Field pairs for the HSET in the commit pipeline.
    pub(crate) fn to_pairs(&self) -> Result<Vec<(&'static str, String)>> {
        let mut pairs = vec![
            (F_ID_KEY, self.id_key.clone()),
            (F_VALUE_KEY, self.value_key.clone()),
        ];
        if let Some(tags_key) = &self.tags_key {
            pairs.push((F_TAGS_KEY, tags_key.clone()));
        }
        if let Some(vary) = &self.vary {
            let raw = serde_json::to_string(vary)
                .map_err(|error| CacheError::Serialization(error.to_string()))?;
            pairs.push((F_VARY, raw));
        }
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_through_hash() {
        let mut vary = Vary::new();
        vary.insert("accept".to_string(), Some("text/html".to_string()));
        let record = MetadataRecord {
            id_key: "ids:x".to_string(),
            value_key: "values:x".to_string(),
            tags_key: Some("cache-tags:a:x".to_string()),
            vary: Some(vary),
        };

        let hash: HashMap<String, String> = record
            .to_pairs()
            .unwrap()
            .into_iter()
            .map(|(field, value)| (field.to_string(), value))
            .collect();
        assert_eq!(MetadataRecord::from_hash(&hash).unwrap(), record);
    }

    #[test]
    fn test_missing_pointer_field_is_undecodable() {
        let mut hash = HashMap::new();
        hash.insert(F_ID_KEY.to_string(), "ids:x".to_string());
        assert!(MetadataRecord::from_hash(&hash).is_err());
    }

    #[test]
    fn test_malformed_vary_is_undecodable() {
        let mut hash = HashMap::new();
        hash.insert(F_ID_KEY.to_string(), "ids:x".to_string());
        hash.insert(F_VALUE_KEY.to_string(), "values:x".to_string());
        hash.insert(F_VARY.to_string(), "{not json".to_string());
        assert!(MetadataRecord::from_hash(&hash).is_err());
    }

    #[test]
    fn test_optional_fields_absent() {
        let mut hash = HashMap::new();
        hash.insert(F_ID_KEY.to_string(), "ids:x".to_string());
        hash.insert(F_VALUE_KEY.to_string(), "values:x".to_string());
        let record = MetadataRecord::from_hash(&hash).unwrap();
        assert!(record.tags_key.is_none());
        assert!(record.vary.is_none());
    }
}

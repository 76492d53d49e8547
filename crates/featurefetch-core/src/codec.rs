//! Key codec: entity keys → physical store lookup keys
//!
//! A GroupBy declares a key schema (names and types). Encoding checks the
//! request's keys against that schema and produces a [`PhysicalLookupKey`]
//! that is identical for identical logical keys, whatever order the caller
//! inserted them in. Identical physical keys are what the dispatcher
//! coalesces into a single store lookup.
//!
//! ## Key Format
//!
//! `key_bytes` is the MessagePack encoding of the `(name, value)` pairs
//! sorted by key name. Keys the schema does not mention are ignored.

use crate::{FeatureValue, FetchError, Result, ValueType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Largest integer magnitude an f64 holds exactly
const MAX_EXACT_FLOAT_INT: u64 = 1 << 53;

/// One entity key column of a GroupBy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyField {
    pub name: String,
    pub key_type: ValueType,
}

impl KeyField {
    pub fn new(name: impl Into<String>, key_type: ValueType) -> Self {
        Self {
            name: name.into(),
            key_type,
        }
    }
}

/// Encoded (dataset, entity keys) pair used against the store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PhysicalLookupKey {
    /// Dataset (store table / partition) the key lives in
    pub dataset: String,
    pub key_bytes: Vec<u8>,
}

impl PhysicalLookupKey {
    /// Flat binary key: `{dataset}:{key_bytes}`
    pub fn to_store_key(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.dataset.len() + 1 + self.key_bytes.len());
        out.extend_from_slice(self.dataset.as_bytes());
        out.push(b':');
        out.extend_from_slice(&self.key_bytes);
        out
    }
}

impl fmt::Display for PhysicalLookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.dataset)?;
        for byte in &self.key_bytes {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Encodes entity keys for a dataset with the given key schema
///
/// Fails with [`FetchError::InvalidKey`] when a schema key is missing, null,
/// or has the wrong type. An `Int` supplied for a `Float` key is widened.
pub fn encode(
    keys: &HashMap<String, FeatureValue>,
    schema: &[KeyField],
    dataset: &str,
) -> Result<PhysicalLookupKey> {
    let mut fields: Vec<&KeyField> = schema.iter().collect();
    fields.sort_by(|a, b| a.name.cmp(&b.name));

    let mut pairs: Vec<(&str, FeatureValue)> = Vec::with_capacity(fields.len());
    for field in fields {
        let value = keys.get(&field.name).ok_or_else(|| {
            FetchError::invalid_key(format!(
                "missing key '{}' for dataset '{}'",
                field.name, dataset
            ))
        })?;
        pairs.push((field.name.as_str(), coerce(field, value)?));
    }

    let key_bytes = rmp_serde::to_vec(&pairs).map_err(FetchError::serialization)?;

    Ok(PhysicalLookupKey {
        dataset: dataset.to_string(),
        key_bytes,
    })
}

fn coerce(field: &KeyField, value: &FeatureValue) -> Result<FeatureValue> {
    match (field.key_type, value) {
        (_, FeatureValue::Null) => Err(FetchError::invalid_key(format!(
            "key '{}' is null",
            field.name
        ))),
        (ValueType::Float, FeatureValue::Int(v)) if v.unsigned_abs() <= MAX_EXACT_FLOAT_INT => {
            Ok(FeatureValue::Float(*v as f64))
        }
        (ValueType::Float, FeatureValue::Int(v)) => Err(FetchError::invalid_key(format!(
            "key '{}' value {} has no exact float representation",
            field.name, v
        ))),
        (expected, v) if v.value_type() == Some(expected) => Ok(v.clone()),
        (expected, v) => Err(FetchError::invalid_key(format!(
            "key '{}' expects {:?}, got {:?}",
            field.name,
            expected,
            v.value_type()
        ))),
    }
}

/// Applies a chain of key renames (request key name → GroupBy key name)
///
/// Each mapping copies the value of `from` to `to`; names without a mapping
/// pass through unchanged. Mappings apply in order, outermost Join first.
pub fn remap_keys(
    keys: &HashMap<String, FeatureValue>,
    mappings: &[HashMap<String, String>],
) -> HashMap<String, FeatureValue> {
    let mut current = keys.clone();
    for mapping in mappings {
        if mapping.is_empty() {
            continue;
        }
        let mut next = current.clone();
        for (from, to) in mapping {
            if let Some(value) = current.get(from) {
                next.insert(to.clone(), value.clone());
            }
        }
        current = next;
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_item_schema() -> Vec<KeyField> {
        vec![
            KeyField::new("user_id", ValueType::Int),
            KeyField::new("item_id", ValueType::String),
        ]
    }

    fn keys(pairs: &[(&str, FeatureValue)]) -> HashMap<String, FeatureValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_encode_is_order_independent() {
        let mut a = HashMap::new();
        a.insert("user_id".to_string(), FeatureValue::Int(1));
        a.insert("item_id".to_string(), FeatureValue::from("sku"));

        let mut b = HashMap::new();
        b.insert("item_id".to_string(), FeatureValue::from("sku"));
        b.insert("user_id".to_string(), FeatureValue::Int(1));

        let schema = user_item_schema();
        let mut reversed = schema.clone();
        reversed.reverse();

        let ka = encode(&a, &schema, "purchases").unwrap();
        let kb = encode(&b, &reversed, "purchases").unwrap();
        assert_eq!(ka, kb);
    }

    #[test]
    fn test_encode_distinguishes_values_and_datasets() {
        let schema = user_item_schema();
        let k1 = keys(&[("user_id", 1i64.into()), ("item_id", "a".into())]);
        let k2 = keys(&[("user_id", 2i64.into()), ("item_id", "a".into())]);

        assert_ne!(
            encode(&k1, &schema, "purchases").unwrap(),
            encode(&k2, &schema, "purchases").unwrap()
        );
        assert_ne!(
            encode(&k1, &schema, "purchases").unwrap(),
            encode(&k1, &schema, "views").unwrap()
        );
    }

    #[test]
    fn test_encode_ignores_extra_keys() {
        let schema = vec![KeyField::new("user_id", ValueType::Int)];
        let plain = keys(&[("user_id", 7i64.into())]);
        let extra = keys(&[("user_id", 7i64.into()), ("session", "s1".into())]);
        assert_eq!(
            encode(&plain, &schema, "ds").unwrap(),
            encode(&extra, &schema, "ds").unwrap()
        );
    }

    #[test]
    fn test_encode_missing_key() {
        let err = encode(&keys(&[("user_id", 1i64.into())]), &user_item_schema(), "ds").unwrap_err();
        assert!(matches!(err, FetchError::InvalidKey(msg) if msg.contains("item_id")));
    }

    #[test]
    fn test_encode_type_mismatch_and_null() {
        let schema = vec![KeyField::new("user_id", ValueType::Int)];
        let err = encode(&keys(&[("user_id", "abc".into())]), &schema, "ds").unwrap_err();
        assert!(matches!(err, FetchError::InvalidKey(_)));

        let err = encode(&keys(&[("user_id", FeatureValue::Null)]), &schema, "ds").unwrap_err();
        assert!(matches!(err, FetchError::InvalidKey(msg) if msg.contains("null")));
    }

    #[test]
    fn test_encode_widens_int_to_float() {
        let schema = vec![KeyField::new("lat", ValueType::Float)];
        let as_int = encode(&keys(&[("lat", 3i64.into())]), &schema, "ds").unwrap();
        let as_float = encode(&keys(&[("lat", 3.0f64.into())]), &schema, "ds").unwrap();
        assert_eq!(as_int, as_float);
    }

    #[test]
    fn test_encode_rejects_ints_floats_cannot_hold() {
        let schema = vec![KeyField::new("score", ValueType::Float)];
        let limit = 1i64 << 53;
        assert!(encode(&keys(&[("score", limit.into())]), &schema, "ds").is_ok());
        assert!(encode(&keys(&[("score", (-limit).into())]), &schema, "ds").is_ok());

        for v in [limit + 1, i64::MAX, i64::MIN] {
            let err = encode(&keys(&[("score", v.into())]), &schema, "ds").unwrap_err();
            assert!(matches!(err, FetchError::InvalidKey(_)));
        }
    }

    #[test]
    fn test_empty_schema_accepts_empty_keys() {
        let key = encode(&HashMap::new(), &[], "global_stats").unwrap();
        assert_eq!(key.dataset, "global_stats");
    }

    #[test]
    fn test_store_key_and_display() {
        let key = PhysicalLookupKey {
            dataset: "ds".to_string(),
            key_bytes: vec![0xab, 0x01],
        };
        assert_eq!(key.to_store_key(), vec![b'd', b's', b':', 0xab, 0x01]);
        assert_eq!(key.to_string(), "ds:ab01");
    }

    #[test]
    fn test_remap_keys_chain() {
        let input = keys(&[("buyer", 9i64.into()), ("item_id", "x".into())]);
        let mut outer = HashMap::new();
        outer.insert("buyer".to_string(), "account".to_string());
        let mut inner = HashMap::new();
        inner.insert("account".to_string(), "user_id".to_string());

        let out = remap_keys(&input, &[outer, inner]);
        assert_eq!(out.get("user_id"), Some(&FeatureValue::Int(9)));
        assert_eq!(out.get("item_id"), Some(&FeatureValue::from("x")));
    }
}

//! Merged configuration mapping and its fingerprint
//!
//! The configuration is the single input to manifest rendering. Its
//! fingerprint decides whether the desired state changed since the last
//! successful apply, so it must be order-insensitive but sensitive to every
//! value, including the credential.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::Error;

/// Key/value configuration consumed by manifest rendering.
///
/// Backed by a `BTreeMap` so iteration and serialization are always in key
/// order. Empty strings and nulls are never stored.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Configuration(BTreeMap<String, Value>);

impl Configuration {
    /// Create an empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, dropping empty strings and nulls.
    ///
    /// An empty value removes any earlier entry for the key, so an unset
    /// option never shadows nor keeps a stale value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        if is_empty_value(&value) {
            self.0.remove(&key);
        } else {
            self.0.insert(key, value);
        }
    }

    /// Layer every entry of `other` over this configuration
    pub fn extend<K, V>(&mut self, other: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<Value>,
    {
        for (k, v) in other {
            self.insert(k, v);
        }
    }

    /// Move the value stored under `from` to `to`
    pub fn rename(&mut self, from: &str, to: &str) {
        if let Some(value) = self.0.remove(from) {
            self.insert(to, value);
        }
    }

    /// Get a raw value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Get a string value
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Whether a key is present
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Iterate entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the configuration has no entries
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Compute the fingerprint of this configuration.
    ///
    /// Serializes the sorted mapping as compact JSON and digests it with
    /// SHA-256. Nested objects are canonicalized too.
    pub fn fingerprint(&self) -> ConfigFingerprint {
        use aws_lc_rs::digest;

        let canonical = canonical_json(&Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ));
        let hash = digest::digest(&digest::SHA256, canonical.as_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(hash.as_ref());
        ConfigFingerprint(bytes)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Configuration {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut config = Configuration::new();
        config.extend(iter);
        config
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Serialize a JSON value with object keys sorted at every level
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            let body = sorted
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), canonical_json(v)))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{}}}", body)
        }
        Value::Array(items) => {
            let body = items.iter().map(canonical_json).collect::<Vec<_>>().join(",");
            format!("[{}]", body)
        }
        other => other.to_string(),
    }
}

/// SHA-256 digest of a canonicalized [`Configuration`]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConfigFingerprint([u8; 32]);

impl ConfigFingerprint {
    /// Combine fingerprints of several manifest sets.
    ///
    /// XOR is order-independent; the combination of a single fingerprint is
    /// the fingerprint itself.
    pub fn combine(fingerprints: impl IntoIterator<Item = ConfigFingerprint>) -> Option<Self> {
        fingerprints.into_iter().reduce(|acc, fp| {
            let mut out = [0u8; 32];
            for (i, byte) in out.iter_mut().enumerate() {
                *byte = acc.0[i] ^ fp.0[i];
            }
            ConfigFingerprint(out)
        })
    }

    /// Lowercase hex representation
    pub fn to_hex(&self) -> String {
        self.0.iter().fold(String::with_capacity(64), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        })
    }

    /// Parse a lowercase or uppercase hex representation
    pub fn from_hex(hex: &str) -> Result<Self, Error> {
        if hex.len() != 64 || !hex.is_ascii() {
            return Err(Error::serialization(format!(
                "fingerprint must be 64 hex characters, got {}",
                hex.len()
            )));
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|e| Error::serialization(format!("invalid fingerprint: {}", e)))?;
        }
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for ConfigFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConfigFingerprint({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for ConfigFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for ConfigFingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ConfigFingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        ConfigFingerprint::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::DomainError;

/// A `sha256:<hex>` content identifier (lowercase hex).
///
/// Used for manifests, bundles and deployment YAMLs. Stored in its full
/// prefixed form so values copied out of logs are directly comparable with
/// what the fleet manager sends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Compute the digest of raw bytes.
    pub fn sha256(bytes: &[u8]) -> Digest {
        Digest(format!("sha256:{:x}", Sha256::digest(bytes)))
    }

    /// Serialize `value` to canonical JSON (object keys sorted) and digest it.
    /// Map field ordering must not affect the result.
    pub fn of_canonical_json<T: Serialize>(value: &T) -> Digest {
        let v = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
        let canonical = sort_json_keys(v);
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        Digest::sha256(&bytes)
    }

    /// Parse and validate a `sha256:<hex>` string.
    pub fn parse(s: &str) -> Result<Digest, DomainError> {
        let hex = s
            .strip_prefix("sha256:")
            .ok_or_else(|| DomainError::InvalidDigest(s.to_string()))?;
        if hex.len() != 64 || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(DomainError::InvalidDigest(s.to_string()));
        }
        Ok(Digest(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Digest {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Digest::parse(&s)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> String {
        d.0
    }
}

/// Recursively sort JSON object keys so HashMap field ordering doesn't affect
/// the digest.
fn sort_json_keys(v: serde_json::Value) -> serde_json::Value {
    match v {
        serde_json::Value::Object(map) => {
            let sorted: std::collections::BTreeMap<String, serde_json::Value> = map
                .into_iter()
                .map(|(k, v)| (k, sort_json_keys(v)))
                .collect();
            serde_json::Value::Object(sorted.into_iter().collect())
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.into_iter().map(sort_json_keys).collect())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_matches_known_vector() {
        // sha256("") is the canonical empty digest
        let d = Digest::sha256(b"");
        assert_eq!(
            d.as_str(),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn parse_rejects_bad_forms() {
        assert!(Digest::parse("md5:abcd").is_err());
        assert!(Digest::parse("sha256:XYZ").is_err());
        assert!(Digest::parse("sha256:abc").is_err());
        // uppercase hex is not canonical
        let upper = format!("sha256:{}", "A".repeat(64));
        assert!(Digest::parse(&upper).is_err());
        let ok = Digest::sha256(b"x");
        assert!(Digest::parse(ok.as_str()).is_ok());
    }

    #[test]
    fn canonical_json_is_key_order_independent() {
        use std::collections::HashMap;
        let mut a = HashMap::new();
        a.insert("b", 1);
        a.insert("a", 2);
        let mut b = HashMap::new();
        b.insert("a", 2);
        b.insert("b", 1);
        assert_eq!(Digest::of_canonical_json(&a), Digest::of_canonical_json(&b));
    }

    #[test]
    fn serde_round_trips_and_validates() {
        let d = Digest::sha256(b"payload");
        let json = serde_json::to_string(&d).unwrap();
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(d, back);
        assert!(serde_json::from_str::<Digest>("\"sha256:nothex\"").is_err());
    }
}

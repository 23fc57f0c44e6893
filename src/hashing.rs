//! Hashing System - SHA-256 Fingerprints
//!
//! A fingerprint is the cache key and job identifier for one formula.
//! It is computed over the validated, trimmed formula text only, so
//! identical formulas always resolve to the same artifact.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of a fingerprint in hex characters.
pub const FINGERPRINT_LEN: usize = 64;

/// Compute SHA-256 hash of bytes, return hex string
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    hex::encode(result)
}

/// Deterministic digest of a validated formula.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint an already validated formula.
    ///
    /// Callers must pass the cleaned text returned by the validator;
    /// hashing raw input would split one formula across several keys.
    pub fn of(cleaned_formula: &str) -> Self {
        Self(sha256_hex(cleaned_formula.as_bytes()))
    }

    /// Parse a fingerprint received from a caller or over the wire.
    ///
    /// Only lowercase hex of the exact digest length is accepted, which
    /// also keeps fingerprints safe to use as file name components.
    pub fn parse(value: &str) -> Result<Self, InvalidFingerprint> {
        let well_formed = value.len() == FINGERPRINT_LEN
            && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if well_formed {
            Ok(Self(value.to_string()))
        } else {
            Err(InvalidFingerprint(value.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines and workspace names.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = InvalidFingerprint;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid fingerprint: {0:?}")]
pub struct InvalidFingerprint(pub String);

// We need hex encoding
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{:02x}", b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        let data = b"test data";
        let h1 = sha256_hex(data);
        let h2 = sha256_hex(data);
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_known_digest() {
        assert_eq!(
            Fingerprint::of("").as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_distinct_formulas_distinct_fingerprints() {
        assert_ne!(Fingerprint::of("x^2"), Fingerprint::of("x^3"));
    }

    #[test]
    fn test_parse_roundtrips_display() {
        let fp = Fingerprint::of("x^2");
        assert_eq!(Fingerprint::parse(&fp.to_string()).unwrap(), fp);
    }

    #[test]
    fn test_parse_rejects_path_like_input() {
        assert!(Fingerprint::parse("../../etc/passwd").is_err());
        assert!(Fingerprint::parse(&"A".repeat(FINGERPRINT_LEN)).is_err());
        assert!(Fingerprint::parse("abc").is_err());
    }

    #[test]
    fn test_serde_rejects_malformed() {
        let bad: Result<Fingerprint, _> = serde_json::from_str("\"not-a-hash\"");
        assert!(bad.is_err());
        let fp = Fingerprint::of("y");
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(serde_json::from_str::<Fingerprint>(&json).unwrap(), fp);
    }
}

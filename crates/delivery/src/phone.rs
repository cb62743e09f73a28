//! Recipient phone numbers.
//!
//! Outbound sends require strict E.164 (`+` followed by up to 15 digits, no
//! leading zero). Inbound provider payloads usually carry the bare digits, so
//! lookups go through [`normalize_phone`] before hashing.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use surveyline_core::DomainError;

static E164: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\+[1-9][0-9]{1,14}$").expect("valid E.164 regex"));

/// A validated E.164 phone number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Validate a caller-supplied number. No normalization is applied: `5511999999999`
    /// is rejected, `+5511999999999` is accepted.
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        if E164.is_match(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(DomainError::validation(format!(
                "phone number must be E.164 formatted (e.g. +5511999999999), got '{raw}'"
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lookup hash for this number.
    pub fn hash(&self) -> String {
        recipient_hash(&self.0)
    }
}

impl core::fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical `+<digits>` form used for hashing.
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    format!("+{digits}")
}

/// Hex SHA-256 of the normalized number.
///
/// Used for joins and lookups so indexes never hold the plaintext address.
pub fn recipient_hash(raw: &str) -> String {
    let normalized = normalize_phone(raw);
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

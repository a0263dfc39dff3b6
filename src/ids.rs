//! Opaque identifier types used across the job lifecycle.
//!
//! [`JobId`] follows the format from the spec: `kk_` followed by a 26
//! character Crockford base32 string — this is exactly the shape of a ULID,
//! so we borrow ULID's monotonic-random generation instead of hand-rolling a
//! base32 encoder.

use rand::RngCore;
use rand::rngs::OsRng;
use std::fmt;
use std::str::FromStr;

const CROCKFORD_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generates a new time-ordered job id: `kk_` + 26 Crockford-base32 chars.
    ///
    /// The first 10 characters encode milliseconds since the Unix epoch (48
    /// bits, ULID-style), the remaining 16 are cryptographically random —
    /// this keeps ids roughly sortable without leaking a full timestamp's
    /// worth of entropy loss.
    pub fn generate(now_millis: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0] = (now_millis >> 40) as u8;
        bytes[1] = (now_millis >> 32) as u8;
        bytes[2] = (now_millis >> 24) as u8;
        bytes[3] = (now_millis >> 16) as u8;
        bytes[4] = (now_millis >> 8) as u8;
        bytes[5] = now_millis as u8;
        OsRng.fill_bytes(&mut bytes[6..]);
        Self(format!("kk_{}", encode_crockford(&bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_valid(s: &str) -> bool {
        s.strip_prefix("kk_").is_some_and(|rest| {
            rest.len() == 26 && rest.bytes().all(|b| CROCKFORD_ALPHABET.contains(&b))
        })
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if Self::is_valid(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(format!("invalid job id: {s}"))
        }
    }
}

/// Encodes 16 bytes (128 bits) as 26 Crockford base32 characters (130 bits,
/// top 2 bits always zero), matching the canonical ULID text encoding.
fn encode_crockford(bytes: &[u8; 16]) -> String {
    let mut value: u128 = 0;
    for &b in bytes {
        value = (value << 8) | b as u128;
    }
    let mut out = [0u8; 26];
    for i in (0..26).rev() {
        out[i] = CROCKFORD_ALPHABET[(value & 0x1f) as usize];
        value >>= 5;
    }
    String::from_utf8(out.to_vec()).expect("crockford alphabet is ASCII")
}

/// A 64-character lowercase hex secret: job tokens and auth tokens share this shape.
#[derive(Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct HexSecret(String);

impl HexSecret {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_valid(s: &str) -> bool {
        s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
    }
}

impl fmt::Debug for HexSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HexSecret(***)")
    }
}

impl fmt::Display for HexSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for HexSecret {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_round_trips_through_display_and_parse() {
        let id = JobId::generate(1_700_000_000_000);
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn job_id_has_expected_shape() {
        let id = JobId::generate(0);
        assert!(JobId::is_valid(id.as_str()));
        assert_eq!(id.as_str().len(), 3 + 26);
    }

    #[test]
    fn job_id_rejects_bad_prefix_and_length() {
        assert!(!JobId::is_valid("kk_short"));
        assert!(JobId::from_str("nope_00000000000000000000000000").is_err());
    }

    #[test]
    fn hex_secret_has_expected_shape() {
        let token = HexSecret::generate();
        assert!(HexSecret::is_valid(token.as_str()));
        assert_eq!(token.as_str().len(), 64);
    }
}

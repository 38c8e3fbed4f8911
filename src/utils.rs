//! Utility functions for identifiers and hashing

use bech32::Bech32m;
use uuid7::uuid7;

/// Human readable prefix of write-attempt session tokens.
pub const SESSION_HRP: &str = "sess";

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// A fresh token identifying one write attempt against a tank slot.
pub fn new_session_id() -> String {
    // SESSION_HRP always parses
    new_uuid_to_bech32(SESSION_HRP).unwrap_or_else(|_| format!("{SESSION_HRP}1{}", uuid7()))
}

/// Content address for a stored blob.
pub fn digest_blob(blob: &[u8]) -> String {
    sha256::digest(blob)
}

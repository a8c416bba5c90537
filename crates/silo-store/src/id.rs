//! Object identifiers.
//!
//! Chunks and file records are both named by a 128-bit identifier whose
//! canonical text form is 32 lowercase hex characters. Identifiers are
//! supplied by callers (a chunk id is the content digest computed on the
//! client side); the store never derives them itself.

use crate::{Result, StoreError};

/// Length of the canonical hex form.
pub const HEX_LEN: usize = 32;

/// A 128-bit object identifier (16 raw bytes).
pub type ObjectId = [u8; 16];

/// Tell whether `s` is a well-formed identifier: exactly 32 characters,
/// each a decimal digit or a hex letter a-f. Case-insensitive.
pub fn is_valid(s: &str) -> bool {
    s.len() == HEX_LEN
        && s.chars()
            .all(|c| c.is_ascii_digit() || matches!(c.to_ascii_lowercase(), 'a'..='f'))
}

/// Parse the hex form of an identifier, folding case.
pub fn parse(s: &str) -> Result<ObjectId> {
    if !is_valid(s) {
        return Err(StoreError::InvalidId(s.to_string()));
    }
    let mut id = [0u8; 16];
    hex::decode_to_slice(s.to_ascii_lowercase(), &mut id)
        .map_err(|_| StoreError::InvalidId(s.to_string()))?;
    Ok(id)
}

/// Render an identifier as 32 lowercase hex characters.
pub fn to_hex(id: &ObjectId) -> String {
    hex::encode(id)
}

/// Extract the identifier from a path-like string such as `/store/<id>`.
///
/// The last non-empty `/`-separated component is taken, so a trailing
/// slash falls back to the component before it.
pub fn from_path(path: &str) -> Result<ObjectId> {
    let last = path
        .split('/')
        .rev()
        .find(|c| !c.is_empty())
        .unwrap_or_default();
    parse(last)
}

/// Content digest of `data`: BLAKE3 truncated to 128 bits.
///
/// Used by clients and tests to derive chunk ids. The store accepts any
/// externally supplied identifier and does not verify it against the data.
pub fn content_id(data: &[u8]) -> ObjectId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(data);
    let mut id = [0u8; 16];
    hasher.finalize_xof().fill(&mut id);
    id
}

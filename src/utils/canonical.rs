//! Canonical, deterministic JSON encoding.
//!
//! Snapshot blobs and definition hashes must byte-compare equal across
//! runs, so everything persisted goes through this module: values are
//! first lifted into `serde_json::Value`, whose object representation is a
//! `BTreeMap` (this crate does not enable serde_json's `preserve_order`
//! feature), and therefore serialize with keys sorted.

use serde::Serialize;

/// Encode a value as canonical key-sorted JSON bytes.
pub fn to_canonical_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    serde_json::to_vec(&value)
}

/// Encode a value as a canonical key-sorted JSON string.
pub fn to_canonical_string<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    serde_json::to_string(&value)
}

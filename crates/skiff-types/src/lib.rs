//! Shared types for the skiff storage framework.
//!
//! This crate defines the [`Semantics`] bundle that governs how batches are
//! executed, plus the deterministic key-to-server mapping used by both
//! clients and tests.

pub mod semantics;

pub use semantics::{Atomicity, Consistency, Ordering, Persistency, Safety, Semantics, Template};

/// Map a key to a server index: first 8 bytes of `blake3(key)` as a
/// little-endian integer, modulo the server count.
///
/// Both object and kv handles derive their home server this way, so every
/// operation on the same name lands on the same server.
///
/// # Panics
///
/// Panics if `server_count` is zero; configurations are validated to contain
/// at least one server before any handle can be constructed.
pub fn key_index(key: &str, server_count: u32) -> u32 {
    assert!(server_count > 0, "server count must be non-zero");

    let hash = blake3::hash(key.as_bytes());
    let bytes: [u8; 8] = hash.as_bytes()[..8].try_into().expect("8 bytes");
    (u64::from_le_bytes(bytes) % u64::from(server_count)) as u32
}

//! Prefixed element IDs and derivation identity.
//!
//! Every knowledge element is keyed by a *derivation key*: a SHA-256 hash
//! over its kind, its sorted upstream references, and a semantic
//! discriminator. Re-running a layer over unchanged upstream lineage
//! recomputes the same key, which is what makes layer re-runs idempotent.

use sha2::{Digest, Sha256};

use crate::models::{ElementKind, JobSource};

/// Bytes of the derivation key kept in the element ID (hex-encoded, so the
/// visible suffix is twice this length).
const ID_BYTES: usize = 16;

/// Compute the derivation key for an element.
///
/// `parents` are upstream refs (element IDs or raw-unit refs); ordering is
/// normalized by sorting so callers need not care about iteration order.
/// `discriminator` separates sibling elements sharing the same parents
/// (e.g. two facts extracted from one session).
pub fn derivation_key(kind: ElementKind, parents: &[String], discriminator: &str) -> String {
    let mut sorted: Vec<&str> = parents.iter().map(String::as_str).collect();
    sorted.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update([0x1f]);
    for parent in sorted {
        hasher.update(parent.as_bytes());
        hasher.update([0x1e]);
    }
    hasher.update(discriminator.as_bytes());
    hex::encode(hasher.finalize())
}

/// Build the prefixed element ID from a derivation key.
pub fn element_id(kind: ElementKind, derivation_key: &str) -> String {
    format!("{}{}", kind.prefix(), &derivation_key[..ID_BYTES * 2])
}

/// Lineage root reference for a chat session.
pub fn session_ref(session_id: &str, source: JobSource) -> String {
    format!("s_{}_{}", source.as_str(), session_id)
}

/// Lineage root reference for a transcript file. Hashes the path so the
/// ref stays stable under directory moves recorded with the same relative
/// path, and contains no filesystem separators.
pub fn transcript_ref(path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("x_{}", &digest[..ID_BYTES * 2])
}

/// True if the ref names a raw unit (session or transcript) rather than a
/// derived element. Raw units are the roots of the lineage DAG.
pub fn is_raw_ref(r: &str) -> bool {
    r.starts_with("s_") || r.starts_with("x_")
}

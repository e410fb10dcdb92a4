//! ID generation for boardkeep entities.

use chrono::{DateTime, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};

/// Prefix for project ids.
pub const PROJECT_PREFIX: &str = "prj";

/// Prefix for epic ids.
pub const EPIC_PREFIX: &str = "epc";

/// Prefix for task ids.
pub const TASK_PREFIX: &str = "tsk";

/// Prefix for API key record ids.
pub const KEY_PREFIX: &str = "key";

/// Generate a unique ID from content + entropy.
/// Format: `<prefix>-` + 10 hex chars of SHA256(seed + timestamp + random)
pub fn generate_id(prefix: &str, seed: &str, created_at: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(created_at.timestamp_nanos_opt().unwrap_or(0).to_le_bytes());
    // Add 8 bytes of randomness to prevent collisions
    hasher.update(rand::rng().random::<[u8; 8]>());
    let hash = hasher.finalize();
    // 10 hex chars = 40 bits = ~1 trillion values
    format!(
        "{}-{:010x}",
        prefix,
        u64::from_be_bytes([hash[0], hash[1], hash[2], hash[3], hash[4], 0, 0, 0]) >> 24
    )
}

/// Generate an id that is not already taken according to `taken`.
///
/// Only ids `taken` reports are avoided. A deleted id is no longer taken, so
/// it is merely improbable, not impossible, to see it again.
pub fn generate_unique_id(
    prefix: &str,
    seed: &str,
    created_at: DateTime<Utc>,
    mut taken: impl FnMut(&str) -> bool,
) -> String {
    loop {
        let id = generate_id(prefix, seed, created_at);
        if !taken(&id) {
            return id;
        }
        log::debug!("id collision on {}, regenerating", id);
    }
}

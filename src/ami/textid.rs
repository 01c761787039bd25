//! Maps textual node identifiers (callsign-only VoIP clients) to a stable
//! negative integer ID, so the rest of the system can treat node IDs as a
//! single uniform integer space.
//!
//! Built as an explicit collaborator rather than a process-wide global so
//! parser and state-manager tests can each construct their own registry.

use std::collections::HashMap;
use std::sync::RwLock;

/// 30-bit mask applied to the FNV-1a hash before negation.
const ID_MASK: u32 = 0x3fff_ffff;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// `text → negative node id` and the reverse mapping, for enrichment lookups.
pub struct TextNodeRegistry {
    by_id: RwLock<HashMap<i64, String>>,
}

impl TextNodeRegistry {
    pub fn new() -> Self {
        Self {
            by_id: RwLock::new(HashMap::new()),
        }
    }

    /// Normalize, hash, and register `text`, returning its stable negative id.
    ///
    /// Idempotent: interning the same text (any case) always returns the same id.
    pub fn intern(&self, text: &str) -> i64 {
        let upper = text.to_uppercase();
        let id = text_node_id(&upper);
        let mut map = self.by_id.write().unwrap_or_else(|e| e.into_inner());
        map.entry(id).or_insert(upper);
        id
    }

    /// Recover the original (uppercased) text for a previously interned id.
    pub fn resolve(&self, id: i64) -> Option<String> {
        self.by_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }
}

impl Default for TextNodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Stable negative id for an already-uppercased textual node identifier.
///
/// A positive AllStar node id never collides with this space since the
/// result is always `<= -1` — a masked hash of `0` is folded to `1` before
/// negation rather than yielding `-0 == 0`, which would otherwise collide
/// with node id 0.
fn text_node_id(upper_text: &str) -> i64 {
    -i64::from(avoid_zero(fnv1a_32(upper_text.as_bytes()) & ID_MASK))
}

/// Folds a masked hash of `0` to `1` so negating it never lands on `0`.
fn avoid_zero(masked_hash: u32) -> u32 {
    if masked_hash == 0 {
        1
    } else {
        masked_hash
    }
}

/// `true` if `node` is already a plain integer (no hashing needed).
pub fn parse_numeric_node(token: &str) -> Option<i64> {
    token.parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_id_is_negative_and_case_insensitive() {
        let reg = TextNodeRegistry::new();
        let a = reg.intern("KF8S");
        let b = reg.intern("kf8s");
        assert_eq!(a, b);
        assert!(a < 0);
    }

    #[test]
    fn text_id_resolves_back_to_uppercased_text() {
        let reg = TextNodeRegistry::new();
        let id = reg.intern("kf8s");
        assert_eq!(reg.resolve(id).as_deref(), Some("KF8S"));
    }

    #[test]
    fn distinct_text_rarely_collides_and_never_with_positive_space() {
        let reg = TextNodeRegistry::new();
        let a = reg.intern("KF8S");
        let b = reg.intern("W1AW");
        assert_ne!(a, b);
        assert!(a < 0 && b < 0);
    }

    #[test]
    fn zero_hash_is_folded_away_from_node_zero() {
        assert_eq!(avoid_zero(0), 1);
        assert_eq!(-i64::from(avoid_zero(0)), -1);
    }
}

//! Fast, non-cryptographic hash of serialized simulation state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// CRC-32 of the snapshot in the high word, snapshot length in the low word.
/// Sensitive to both byte order and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateHash(pub u64);

impl StateHash {
    pub fn of(snapshot: &[u8]) -> Self {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(snapshot);
        let crc = hasher.finalize() as u64;
        StateHash((crc << 32) | (snapshot.len() as u32 as u64))
    }
}

impl fmt::Display for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(StateHash::of(b"state"), StateHash::of(b"state"));
    }

    #[test]
    fn test_hash_is_order_sensitive() {
        assert_ne!(StateHash::of(&[1, 2, 3]), StateHash::of(&[3, 2, 1]));
    }

    #[test]
    fn test_hash_is_length_sensitive() {
        assert_ne!(StateHash::of(&[0]), StateHash::of(&[0, 0]));
        assert_eq!(StateHash::of(&[9; 5]).0 & 0xFFFF_FFFF, 5);
    }
}

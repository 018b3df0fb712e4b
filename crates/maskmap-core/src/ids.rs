//! Collision-resistant identifiers for feedback rows.

use rand::Rng;

use crate::defaults::ID_LENGTH;
use crate::error::Result;

/// URL-safe alphabet (64 symbols).
pub const ALPHABET: &[u8] = b"_-0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Source of unique identifiers; injected so tests can pin ids.
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> Result<String>;
}

/// Random 21-character ids drawn from [`ALPHABET`] (~126 bits of entropy).
#[derive(Debug, Clone, Copy, Default)]
pub struct NanoIdGenerator;

impl NanoIdGenerator {
    pub fn new() -> Self {
        Self
    }
}

impl IdGenerator for NanoIdGenerator {
    fn generate(&self) -> Result<String> {
        let mut rng = rand::thread_rng();
        Ok((0..ID_LENGTH)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_nanoid_length_and_alphabet() {
        let id = NanoIdGenerator::new().generate().unwrap();
        assert_eq!(id.len(), 21);
        assert!(id.bytes().all(|b| ALPHABET.contains(&b)));
    }

    #[test]
    fn test_nanoid_no_collisions_in_sample() {
        let gen = NanoIdGenerator::new();
        let ids: HashSet<String> = (0..10_000).map(|_| gen.generate().unwrap()).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn test_alphabet_has_64_unique_symbols() {
        let unique: HashSet<u8> = ALPHABET.iter().copied().collect();
        assert_eq!(unique.len(), 64);
    }
}

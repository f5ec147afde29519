//! Fast hashing for dflow's identity and cache tables.
//!
//! Handle identities are stable opaque addresses (spec.md §3.1) and the
//! distributed per-peer cache keys are derived from them by a 32-bit CRC
//! hash (spec.md §4.5) — neither needs a cryptographically strong hash,
//! so we use the same FxHash algorithm as `rustc`/`firefox` rather than
//! `SipHash`, and expose it as a drop-in `HashMap`/`HashSet` alias.

use std::hash::{BuildHasherDefault, Hasher};

pub type FxHashMap<K, V> = hashbrown::HashMap<K, V, BuildHasherDefault<FxHasher>>;
pub type FxHashSet<K> = hashbrown::HashSet<K, BuildHasherDefault<FxHasher>>;

const SEED: u64 = 0x51_7c_c1_b7_27_22_0a_95;

/// The FxHash algorithm: rotate-multiply-xor, one word at a time.
#[derive(Default)]
pub struct FxHasher {
    hash: u64,
}

impl FxHasher {
    #[inline]
    fn write_u64(&mut self, word: u64) {
        self.hash = (self.hash.rotate_left(5) ^ word).wrapping_mul(SEED);
    }
}

impl Hasher for FxHasher {
    #[inline]
    fn write(&mut self, mut bytes: &[u8]) {
        while bytes.len() >= 8 {
            let (chunk, rest) = bytes.split_at(8);
            self.write_u64(u64::from_ne_bytes(chunk.try_into().unwrap()));
            bytes = rest;
        }
        if bytes.len() >= 4 {
            let (chunk, rest) = bytes.split_at(4);
            self.write_u64(u64::from(u32::from_ne_bytes(chunk.try_into().unwrap())));
            bytes = rest;
        }
        for &b in bytes {
            self.write_u64(u64::from(b));
        }
    }

    #[inline]
    fn write_u8(&mut self, i: u8) {
        self.write_u64(u64::from(i));
    }

    #[inline]
    fn write_u32(&mut self, i: u32) {
        self.write_u64(u64::from(i));
    }

    #[inline]
    fn write_u64(&mut self, i: u64) {
        FxHasher::write_u64(self, i);
    }

    #[inline]
    fn write_usize(&mut self, i: usize) {
        self.write_u64(i as u64);
    }

    #[inline]
    fn finish(&self) -> u64 {
        self.hash
    }
}

/// CRC-32 (IEEE) of an opaque identity, used as the 32-bit cache key in
/// the distributed per-peer transfer cache (spec.md §4.5).
#[must_use]
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in bytes {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            let mask = 0_u32.wrapping_sub(crc & 1);
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

/// Convenience wrapper for hashing a pointer-sized identity.
#[must_use]
pub fn crc32_identity(identity: usize) -> u32 {
    crc32(&identity.to_ne_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_known_vector() {
        // "123456789" -> 0xCBF43926 is the standard CRC-32/ISO-HDLC check value.
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn crc32_identity_is_deterministic() {
        assert_eq!(crc32_identity(0x1234), crc32_identity(0x1234));
        assert_ne!(crc32_identity(0x1234), crc32_identity(0x1235));
    }

    #[test]
    fn fxhashmap_basic() {
        let mut map: FxHashMap<u32, &str> = FxHashMap::default();
        map.insert(1, "one");
        map.insert(2, "two");
        assert_eq!(map.get(&1), Some(&"one"));
        assert_eq!(map.len(), 2);
    }
}

// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::{
    convert::TryInto as _,
    hash::Hasher as _,
};

use rustc_hash::FxHasher;

/// The key hashing capability of a cache.
///
/// A hasher turns an arbitrary byte key into the 32-bit hash that drives
/// bucket placement, and decides key equality. Implementations are stateless
/// markers so that the hash functions inline into the hot path; the cache
/// types are generic over this trait and no dynamic dispatch occurs per
/// operation.
///
/// Returned hashes are never `0`: that value is reserved as the empty-slot
/// sentinel inside buckets.
pub trait Hasher: Send + Sync + 'static {
    const NAME: &'static str;

    fn hash(key: &[u8]) -> u32;

    fn same_key(a: &[u8], b: &[u8]) -> bool;
}

fn finalize(h: u64) -> u32 {
    // splitmix64 finalizer. Bucket selection uses the *top* bits of the
    // 32-bit hash, so the raw FxHash value needs a full-width mix first.
    let mut z = h;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^= z >> 31;
    let out = (z >> 32) as u32;
    if out == 0 {
        1
    } else {
        out
    }
}

fn hash_bytes(key: &[u8]) -> u32 {
    let mut h = FxHasher::default();
    h.write(key);
    finalize(h.finish())
}

/// Plain binary key equality.
pub enum BinaryKeyHasher {}

impl Hasher for BinaryKeyHasher {
    const NAME: &'static str = "binary-key-hasher";

    fn hash(key: &[u8]) -> u32 {
        hash_bytes(key)
    }

    fn same_key(a: &[u8], b: &[u8]) -> bool {
        a == b
    }
}

/// Key equality with numeric normalization.
///
/// Keys may carry a numeric tag: [`TAG_INT`] followed by an `i64` in
/// little-endian order, or [`TAG_DOUBLE`] followed by an IEEE 754 `f64` in
/// little-endian order. A double holding an integral value that is exactly
/// representable as `i64` is normalized to the integer form before hashing
/// and comparison, so `int(i)` and `double(i)` denote the same cache entry.
///
/// Doubles outside the `i64` range, NaNs and non-integral doubles fall back
/// to their raw encoding, as does every untagged key. Two NaN keys with the
/// same bit pattern compare equal (raw-byte equality).
pub enum NumericKeyHasher {}

/// Tag byte announcing an `i64` little-endian payload.
pub const TAG_INT: u8 = 0x01;
/// Tag byte announcing an `f64` little-endian payload.
pub const TAG_DOUBLE: u8 = 0x02;

fn canonical_int(key: &[u8]) -> Option<i64> {
    if key.len() != 9 {
        return None;
    }
    let payload: [u8; 8] = key[1..].try_into().ok()?;
    match key[0] {
        TAG_INT => Some(i64::from_le_bytes(payload)),
        TAG_DOUBLE => {
            let f = f64::from_le_bytes(payload);
            // -2^63 and 2^63 are exactly representable as f64; the upper
            // bound itself is out of range for i64.
            if f.is_finite()
                && f.fract() == 0.0
                && f >= -9_223_372_036_854_775_808.0
                && f < 9_223_372_036_854_775_808.0
            {
                let i = f as i64;
                if i as f64 == f {
                    return Some(i);
                }
            }
            None
        },
        _ => None,
    }
}

impl Hasher for NumericKeyHasher {
    const NAME: &'static str = "numeric-key-hasher";

    fn hash(key: &[u8]) -> u32 {
        match canonical_int(key) {
            Some(i) => {
                let mut canonical = [0u8; 9];
                canonical[0] = TAG_INT;
                canonical[1..].copy_from_slice(&i.to_le_bytes());
                hash_bytes(&canonical)
            },
            None => hash_bytes(key),
        }
    }

    fn same_key(a: &[u8], b: &[u8]) -> bool {
        match (canonical_int(a), canonical_int(b)) {
            (Some(x), Some(y)) => x == y,
            (None, None) => a == b,
            _ => false,
        }
    }
}

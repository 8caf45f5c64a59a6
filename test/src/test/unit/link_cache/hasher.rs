// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use link_cache::hasher::{BinaryKeyHasher, Hasher, NumericKeyHasher, TAG_DOUBLE, TAG_INT};

fn int_key(i: i64) -> Vec<u8> {
    let mut key = vec![TAG_INT];
    key.extend_from_slice(&i.to_le_bytes());
    key
}

fn double_key(f: f64) -> Vec<u8> {
    let mut key = vec![TAG_DOUBLE];
    key.extend_from_slice(&f.to_le_bytes());
    key
}

#[test]
fn binary_keys_compare_bytewise() {
    assert!(BinaryKeyHasher::same_key(b"foo", b"foo"));
    assert!(!BinaryKeyHasher::same_key(b"foo", b"bar"));
    assert!(!BinaryKeyHasher::same_key(b"foo", b"foo "));
    assert_eq!(BinaryKeyHasher::hash(b"foo"), BinaryKeyHasher::hash(b"foo"));
}

#[test]
fn hashes_are_never_the_empty_sentinel() {
    for i in 0u64..4096 {
        assert_ne!(BinaryKeyHasher::hash(&i.to_le_bytes()), 0);
        assert_ne!(NumericKeyHasher::hash(&int_key(i as i64)), 0);
    }
}

#[test]
fn integers_and_integral_doubles_unify() {
    for i in [0i64, 1, -1, 42, -12345, 1 << 31, 1 << 52, -(1 << 52)] {
        assert!(NumericKeyHasher::same_key(&int_key(i), &double_key(i as f64)));
        assert!(NumericKeyHasher::same_key(&double_key(i as f64), &int_key(i)));
        assert_eq!(
            NumericKeyHasher::hash(&int_key(i)),
            NumericKeyHasher::hash(&double_key(i as f64))
        );
    }
}

#[test]
fn non_integral_doubles_stay_separate() {
    assert!(!NumericKeyHasher::same_key(&int_key(1), &double_key(1.5)));
    assert!(!NumericKeyHasher::same_key(&double_key(1.5), &int_key(1)));
    assert!(NumericKeyHasher::same_key(&double_key(1.5), &double_key(1.5)));
}

#[test]
fn out_of_range_doubles_fall_back_to_raw_encoding() {
    let huge = 1.0e300;
    assert!(NumericKeyHasher::same_key(&double_key(huge), &double_key(huge)));
    assert!(!NumericKeyHasher::same_key(&double_key(huge), &int_key(i64::MAX)));

    let nan = f64::NAN;
    // raw-byte equality: a NaN key matches its own bit pattern
    assert!(NumericKeyHasher::same_key(&double_key(nan), &double_key(nan)));
}

#[test]
fn untagged_keys_are_opaque() {
    assert!(NumericKeyHasher::same_key(b"alpha", b"alpha"));
    assert!(!NumericKeyHasher::same_key(b"alpha", b"beta"));
    // an untagged 9-byte key never unifies with a tagged one
    let mut raw = vec![0x7f];
    raw.extend_from_slice(&7i64.to_le_bytes());
    assert!(!NumericKeyHasher::same_key(&raw, &int_key(7)));
}

// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use pretty_assertions::assert_eq;

use link_cache::{Error, Value};

#[test]
fn value_exposes_key_and_payload() {
    let value = Value::new(b"the-key", b"the-payload").unwrap();
    assert_eq!(value.key(), b"the-key");
    assert_eq!(value.value(), b"the-payload");
    // header plus key plus payload
    assert!(value.size() >= (7 + 11) as u64);
}

#[test]
fn empty_keys_are_rejected() {
    assert!(matches!(Value::new(b"", b"payload"), Err(Error::OutOfMemory)));
}

#[test]
fn empty_payloads_are_fine() {
    let value = Value::new(b"key-only", b"").unwrap();
    assert_eq!(value.value(), b"");
}

#[test]
fn dropping_an_uninserted_value_is_clean() {
    // exercised mostly under miri/asan: construct and drop a batch
    for i in 0u64..256 {
        let _ = Value::new(&i.to_le_bytes(), &vec![0u8; i as usize]).unwrap();
    }
}

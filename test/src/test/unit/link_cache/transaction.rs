// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use pretty_assertions::assert_eq;

use link_cache::transaction::TransactionManager;

#[test]
fn write_transactions_flip_term_parity() {
    let transactions = TransactionManager::new();
    assert_eq!(transactions.term() % 2, 0);

    let tx = transactions.begin(false);
    assert_eq!(transactions.term() % 2, 1);
    assert!(!tx.read_only());
    assert_eq!(tx.term(), transactions.term());

    transactions.end(tx);
    assert_eq!(transactions.term() % 2, 0);
}

#[test]
fn read_only_transactions_do_not_change_parity() {
    let transactions = TransactionManager::new();
    let term = transactions.term();

    let tx = transactions.begin(true);
    assert_eq!(transactions.term(), term);
    transactions.end(tx);
    assert_eq!(transactions.term(), term);
}

#[test]
fn concurrent_writers_share_one_odd_term() {
    let transactions = TransactionManager::new();

    let first = transactions.begin(false);
    let second = transactions.begin(false);
    assert_eq!(transactions.term() % 2, 1);
    assert_eq!(first.term(), second.term());

    transactions.end(first);
    assert_eq!(transactions.term() % 2, 1);
    transactions.end(second);
    assert_eq!(transactions.term() % 2, 0);
}

#[test]
fn sensitive_readers_delay_the_even_flip() {
    let transactions = TransactionManager::new();

    let writer = transactions.begin(false);
    // begins while the term is odd: may have observed banished state
    let reader = transactions.begin(true);

    transactions.end(writer);
    assert_eq!(transactions.term() % 2, 1);

    transactions.end(reader);
    assert_eq!(transactions.term() % 2, 0);
}

#[test]
fn terms_are_monotonic() {
    let transactions = TransactionManager::new();
    let mut last = transactions.term();
    for _ in 0..16 {
        let tx = transactions.begin(false);
        assert!(transactions.term() > last);
        last = transactions.term();
        transactions.end(tx);
        assert!(transactions.term() > last);
        last = transactions.term();
    }
}

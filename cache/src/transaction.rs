// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Handle for an open transaction against the backing store.
///
/// Obtained from `Manager::begin_transaction` and returned through
/// `Manager::end_transaction`.
#[derive(Debug)]
pub struct Transaction {
    read_only: bool,
    sensitive: bool,
    term: u64,
}

impl Transaction {
    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// The term at which this transaction started.
    pub fn term(&self) -> u64 {
        self.term
    }
}

/// Tracks open transactions and maintains the global term counter.
///
/// The term is even while no sensitive transaction is open and odd
/// otherwise. Writers are always sensitive. A read-only transaction that
/// begins while the term is odd is sensitive too: it may have observed
/// banished state, so the flip back to even waits for it.
pub struct TransactionManager {
    state: Mutex<Counters>,
    term: AtomicU64,
}

#[derive(Default)]
struct Counters {
    open_reads: u64,
    open_sensitive: u64,
    open_writes: u64,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Counters::default()),
            term: AtomicU64::new(0),
        }
    }

    pub fn begin(&self, read_only: bool) -> Transaction {
        let mut state = self.state.lock();

        let sensitive = if read_only {
            state.open_reads += 1;
            self.term.load(Ordering::Relaxed) % 2 == 1
        } else {
            state.open_writes += 1;
            true
        };

        if sensitive {
            state.open_sensitive += 1;
            if state.open_sensitive == 1 {
                let term = self.term.fetch_add(1, Ordering::Release) + 1;
                debug_assert!(term % 2 == 1);
            }
        }

        Transaction {
            read_only,
            sensitive,
            term: self.term.load(Ordering::Relaxed),
        }
    }

    pub fn end(&self, tx: Transaction) {
        let mut state = self.state.lock();

        if tx.read_only {
            debug_assert!(state.open_reads > 0);
            state.open_reads -= 1;
        } else {
            debug_assert!(state.open_writes > 0);
            state.open_writes -= 1;
        }

        if tx.sensitive {
            debug_assert!(state.open_sensitive > 0);
            state.open_sensitive -= 1;
            if state.open_sensitive == 0 {
                let term = self.term.fetch_add(1, Ordering::Release) + 1;
                debug_assert!(term % 2 == 0);
            }
        }
    }

    /// The current term. Odd parity means a sensitive transaction is open.
    pub fn term(&self) -> u64 {
        self.term.load(Ordering::Acquire)
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

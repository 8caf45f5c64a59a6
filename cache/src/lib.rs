// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! Fixed-budget, hash-bucketed in-memory caching.
//!
//! A process hosts one [`manager::Manager`] which arbitrates a global memory
//! budget across any number of caches, leases and recycles their hash
//! tables, rebalances allocations towards frequently accessed caches, and
//! coordinates asynchronous resize and migration work through an injected
//! scheduler hook.
//!
//! Two cache flavors exist: [`cache::PlainCache`], and
//! [`cache::TransactionalCache`] which supports banishing keys tied to a
//! transaction term, so readers cannot observe values that are stale with
//! respect to a concurrent writer on a backing store.

pub mod bucket;
pub mod cache;
pub mod config;
pub mod error;
pub mod hasher;
pub mod manager;
pub mod metadata;
pub mod prng;
pub mod stats;
pub mod sync;
pub mod table;
pub mod transaction;
pub mod value;

mod clock;

pub use cache::{Cache, CacheKind, PlainCache, TransactionalCache, MIN_CACHE_SIZE};
pub use config::CacheOptions;
pub use error::Error;
pub use hasher::{BinaryKeyHasher, Hasher, NumericKeyHasher};
pub use manager::{Job, Manager, MemoryStats, PostFn};
pub use prng::SharedPrng;
pub use transaction::Transaction;
pub use value::{CachedValue, Finding, Value};

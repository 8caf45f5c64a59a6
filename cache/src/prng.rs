// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use rand::Rng as _;

/// A striped, lock-free pseudo random number generator.
///
/// Randomness in the cache is purely statistical: it picks the slot a sampled
/// event lands in and decides whether an operation is sampled at all. Quality
/// therefore matters much less than cost under concurrency. Each stripe is a
/// single cache-line-padded `AtomicU64` stepped with a splitmix64 increment,
/// so `next()` is one `fetch_add` plus a mix -- threads on different stripes
/// never touch the same line.
///
/// The generator is a value that gets injected into the [`Manager`] rather
/// than ambient process state, so tests can share or isolate streams at will.
///
/// [`Manager`]: crate::manager::Manager
pub struct SharedPrng {
    stripes: Box<[Stripe]>,
    mask: usize,
}

#[repr(align(64))]
struct Stripe {
    state: AtomicU64,
}

// splitmix64 constants, Vigna 2015
const GAMMA: u64 = 0x9e37_79b9_7f4a_7c15;

fn mix(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

static NEXT_THREAD_SLOT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_SLOT: usize = NEXT_THREAD_SLOT.fetch_add(1, Ordering::Relaxed);
}

impl SharedPrng {
    const STRIPES: usize = 256;

    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        let stripes = (0..Self::STRIPES)
            .map(|_| Stripe {
                state: AtomicU64::new(rng.gen()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            mask: Self::STRIPES - 1,
            stripes,
        }
    }

    pub fn next(&self) -> u64 {
        let slot = THREAD_SLOT.with(|s| *s) & self.mask;
        let state = self.stripes[slot]
            .state
            .fetch_add(GAMMA, Ordering::Relaxed)
            .wrapping_add(GAMMA);
        mix(state)
    }
}

impl Default for SharedPrng {
    fn default() -> Self {
        Self::new()
    }
}

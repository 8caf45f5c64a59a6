// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::time::Instant;

use once_cell::sync::Lazy;

static BASE: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic microseconds since the first use in this process.
///
/// Request rate-limit windows and the rebalancing grace period are stored in
/// atomics, so they need a scalar clock rather than `Instant` itself.
pub(crate) fn now_micros() -> u64 {
    BASE.elapsed().as_micros() as u64
}

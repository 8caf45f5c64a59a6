// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

/// Configuration of a [`Manager`].
///
/// [`Manager`]: crate::manager::Manager
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Global memory budget for all caches combined, in bytes.
    pub cache_size: u64,

    /// Upper bound on memory kept in spare (pooled) tables.
    pub max_spare_allocation: u64,

    /// Table fill ratio below which a cache asks for a smaller table.
    pub ideal_lower_fill_ratio: f64,

    /// Table fill ratio above which a cache asks for a larger table.
    ///
    /// Values very close to 1.0 are accepted but can thrash migrations.
    pub ideal_upper_fill_ratio: f64,

    /// Collect windowed find statistics at the manager level.
    pub enable_windowed_stats: bool,

    /// Largest accepted record (header + key + value), in bytes.
    pub max_cache_value_size: u64,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            cache_size: 64 * 1024 * 1024,
            max_spare_allocation: 4 * 1024 * 1024,
            ideal_lower_fill_ratio: 0.10,
            ideal_upper_fill_ratio: 0.90,
            enable_windowed_stats: false,
            max_cache_value_size: 4 * crate::cache::MIN_CACHE_SIZE,
        }
    }
}

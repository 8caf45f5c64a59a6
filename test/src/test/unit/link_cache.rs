// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

mod concurrency;
mod hasher;
mod manager;
mod plain;
mod spinlock;
mod transaction;
mod value;

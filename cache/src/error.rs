// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use thiserror::Error;

/// The error surface of the cache subsystem.
///
/// Every fallible operation reports its outcome by value; nothing here is
/// fatal to the caller. [`Error::Busy`] in particular is an entirely normal
/// result of bounded lock acquisition and simply invites a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error("key not found")]
    NotFound,

    #[error("key or hash banished for the current term")]
    Conflict,

    #[error("could not acquire lock within the tries budget")]
    Busy,

    #[error("operation would exceed a memory limit")]
    ResourceLimit,

    #[error("allocation failed")]
    OutOfMemory,

    #[error("shutting down")]
    ShuttingDown,

    #[error("internal invariant violated")]
    Internal,
}

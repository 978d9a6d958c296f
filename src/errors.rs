use std::error::Error as StdError;

use thiserror::Error;

/// Errors that can be returned by rate drivers and the admission
/// front-end.
#[derive(Error, Debug)]
pub enum Error {
    /// The backing store could not be reached or returned garbage.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A queued decay event could not be encoded or decoded.
    #[cfg(feature = "shared_store")]
    #[error("decay event codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// `init` was called on a driver whose workers are already
    /// running.
    #[error("driver is already initialized")]
    AlreadyInitialized,

    /// A driver operation was attempted before `init`.
    #[error("driver is not initialized")]
    NotInitialized,

    /// A background worker thread could not be started.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// The configuration violates one of its constraints.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Failures reported by a [`Store`](../drivers/trait.Store.html)
/// implementation.
///
/// These are transient from the point of view of the admission logic:
/// they get surfaced to the caller of the driver operation, and the
/// admission front-end fails open on them.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The value stored under the key is not an integer counter.
    #[error("value at {0} is not an integer")]
    NotAnInteger(String),

    #[error(transparent)]
    Backend(Box<dyn StdError + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, Error>;

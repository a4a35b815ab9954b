//! Error types for sessions, the registry and connections.

use logzy_core::SpecError;
use thiserror::Error;

/// A session operation that could not be performed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// One of the submitted queries is invalid. Nothing was changed.
    #[error("query {index} is invalid: {source}")]
    InvalidSpec {
        /// Position of the offending query in the submitted list.
        index: usize,
        /// What is wrong with it.
        source: SpecError,
    },
    /// The session has been closed.
    #[error("session is closed")]
    Closed,
}

/// The registry refused to create a session.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The configured session limit is reached.
    #[error("session limit of {limit} reached")]
    CapacityReached {
        /// The configured maximum.
        limit: usize,
    },
}

/// Failure on the client transport.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// The peer is gone.
    #[error("connection closed")]
    Closed,
    /// The underlying transport failed.
    #[error("transport error: {0}")]
    Transport(String),
}

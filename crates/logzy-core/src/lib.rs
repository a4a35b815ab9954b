//! # logzy-core
//!
//! Shared domain types for logzy.
//!
//! - [`SessionId`]: process-unique, monotonically assigned session identity
//! - [`QuerySpec`]: one registered query and its fetch cadence
//! - [`ResultBatch`] / [`Row`]: rows produced by a single fetch
//! - [`protocol`]: the JSON wire format spoken over the WebSocket
//! - [`DataSource`]: the gateway to the query execution engine

#![deny(unsafe_code)]

pub mod batch;
pub mod errors;
pub mod ids;
pub mod protocol;
pub mod query;
pub mod source;

pub use batch::{ResultBatch, Row};
pub use errors::{ProtocolError, SourceError, SpecError};
pub use ids::SessionId;
pub use protocol::{InboundAction, OutboundMessage};
pub use query::QuerySpec;
pub use source::DataSource;

//! # logzy-server
//!
//! Streams periodically refreshed query results to WebSocket clients.
//!
//! - [`registry::SessionRegistry`]: process-wide store of live sessions and the id counter
//! - [`session::ClientSession`]: owns a client's query tasks; start/replace/close
//! - [`task`]: one periodic, cancellable fetch-and-emit loop per query
//! - [`relay`]: the single writer draining a connection's outbound queue
//! - [`dispatcher`]: per-connection read loop and lifecycle
//! - [`server::LogzyServer`]: axum router (`/ws`, `/health`, `/metrics`) and listener

#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod task;

pub use config::ServerConfig;
pub use errors::{ConnectionError, RegistryError, SessionError};
pub use registry::SessionRegistry;
pub use server::LogzyServer;
pub use session::ClientSession;

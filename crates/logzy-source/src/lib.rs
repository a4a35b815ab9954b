//! # logzy-source
//!
//! Data source gateways implementing [`logzy_core::DataSource`].
//!
//! - [`SqliteSource`]: pooled `SQLite` database, one blocking fetch per call
//! - [`MemorySource`]: in-process tables with scriptable failures and latency

#![deny(unsafe_code)]

pub mod memory;
pub mod sqlite;

pub use memory::MemorySource;
pub use sqlite::{SqliteConfig, SqliteSource};

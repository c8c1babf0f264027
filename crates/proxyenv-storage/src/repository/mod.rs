//! Table-level data access.

mod config;

pub use config::ConfigRepo;

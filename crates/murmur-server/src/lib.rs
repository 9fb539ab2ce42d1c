//! # murmur-server
//!
//! Admission service for murmur clients. Arbitrates a global ceiling on
//! realtime connections: each heartbeat answers `active` or `queued`, and the
//! least recently active non-typing clients are the ones queued.

pub mod admission;
pub mod api;
pub mod config;
pub mod error;

pub use admission::AdmissionTable;
pub use api::{build_router, serve, serve_on, AppState};
pub use config::AdmissionConfig;
pub use error::ServerError;

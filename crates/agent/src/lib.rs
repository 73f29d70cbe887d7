//! Embedding host for the sync engine
//!
//! Wires the engine to a REST backend over HTTP and exposes health,
//! readiness, status and Prometheus metrics endpoints.

pub mod api;
pub mod config;
pub mod transport;

//! REST API server module.
//!
//! Provides HTTP endpoints for uploading inputs, submitting conversions,
//! polling job status and downloading results.

pub mod error;
pub mod extract;
pub mod models;
pub mod routes;
pub mod server;

pub use server::{ApiServer, ApiServerConfig, AppState};

//! HTTP server for resumable chunked uploads.
//!
//! This crate provides:
//! - The session registry and lifecycle manager
//! - Chunk receipt, reassembly and hand-off to the object store
//! - Expiry of abandoned sessions
//! - Upload outcome events
//! - The axum HTTP surface and Prometheus metrics

pub mod auth;
pub mod error;
pub mod events;
pub mod handlers;
pub mod lifecycle;
pub mod metrics;
pub mod reassembly;
pub mod receipt;
pub mod registry;
pub mod routes;
pub mod state;
pub mod sweep;

pub use auth::{CallerIdentity, TraceId};
pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;

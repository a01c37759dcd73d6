//! Logging setup shared by taskpilot binaries and tests.
//!
//! Human-readable or JSON output via `tracing-subscriber`, filtered through
//! `RUST_LOG` with a configurable fallback level.

pub mod logging;

pub use logging::{init, init_logging, init_logging_json, LogFormat};

//! Middleware for observability.
//!
//! This module provides request logging with latency tracking for the
//! HTTP surface (health/metrics endpoints; the `/ws` upgrade itself is
//! exempted the same way `/health` is).

pub mod logging;

pub use logging::request_logging_simple;

//! # Courier Config
//!
//! Configuration management for the Courier job queue.
//! Supports layered configuration from files and environment variables,
//! validation that reports every problem at once, and logging setup.

mod app_config;
mod error;
mod loader;
mod telemetry;
mod validation;

pub use app_config::*;
pub use error::*;
pub use loader::*;
pub use telemetry::*;
pub use validation::*;

//! # Precache Common
//!
//! Logging configuration shared by the precache crates and tools.

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat};

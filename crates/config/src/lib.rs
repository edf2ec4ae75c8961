//! Configuration module for reframe
//!
//! Handles loading run configuration from TOML files and environment variable overrides.

pub mod config;

pub use config::*;

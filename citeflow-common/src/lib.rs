//! # citeflow Common Library
//!
//! Shared code for the citeflow crates including:
//! - Error type shared by the engine and its adapters
//! - TOML configuration loading and config file resolution
//! - SQLite database initialization and schema
//! - Timestamp helpers

pub mod config;
pub mod db;
pub mod error;
pub mod time;

pub use error::{Error, Result};

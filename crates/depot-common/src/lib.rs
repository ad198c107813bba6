//! Depot Common - Shared types and utilities
//!
//! This crate provides common types, the error taxonomy, configuration,
//! and digest utilities used across all Depot components.

pub mod config;
pub mod digest;
pub mod error;
pub mod types;

pub use self::config::Config;
pub use digest::{DigestWriter, Digests};
pub use error::{Error, ErrorCategory, ErrorKind, Result};
pub use types::*;

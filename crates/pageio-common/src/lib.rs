//! PageIO Common - Shared types and utilities
//!
//! This crate provides the common vocabulary used across PageIO components:
//! object identifiers, page address newtypes, and error definitions.

pub mod error;
pub mod types;

pub use error::{CacheError, Result};
pub use types::*;

//! ADP Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling and logging for the ad-data pipeline workspace.
//!
//! # Overview
//!
//! This crate provides the functionality used across all ADP workspace
//! members:
//!
//! - **Error Handling**: The `AdpError` taxonomy and `Result` alias
//! - **Logging**: Centralized `tracing` initialization
//!
//! # Example
//!
//! ```no_run
//! use adp_common::{AdpError, Result};
//!
//! fn check_format(name: &str) -> Result<()> {
//!     if !name.ends_with(".csv") {
//!         return Err(AdpError::UnsupportedFormat(name.to_string()));
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{AdpError, Result};

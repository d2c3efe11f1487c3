//! # Wisp Platform
//!
//! Shared types for the wisp SSH client crates.
//!
//! This crate provides the unified error type ([`WispError`], [`WispResult`])
//! and the [`ErrorLevel`] tag callers use to tell retryable failures from
//! fatal ones.
//!
//! # Examples
//!
//! ```
//! use wisp_platform::{WispError, WispResult};
//!
//! fn open() -> WispResult<u32> {
//!     Err(WispError::NoFreeChannels)
//! }
//!
//! assert!(open().is_err());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{ErrorLevel, WispError, WispResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

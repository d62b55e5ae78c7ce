//! aptmirror common library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared building blocks for the aptmirror workspace.
//!
//! - **Error Handling**: [`CommonError`] and the crate [`Result`] alias
//! - **Checksums**: the MD5 [`Digest`] pair compared against store entity tags,
//!   plus SHA-256 helpers for secondary integrity checks
//! - **Logging**: `tracing` subscriber configuration shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use aptmirror_common::checksum::Digest;
//!
//! # async fn run() -> aptmirror_common::Result<()> {
//! let digest = Digest::from_file("/tmp/Release").await?;
//! assert!(digest.matches_etag("\"0cc175b9c0f1b6a831c399e269772661\""));
//! # Ok(())
//! # }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

pub use checksum::Digest;
pub use error::{CommonError, Result};

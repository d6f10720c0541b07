//! Blockrelay Common Library
//!
//! Shared types, utilities, and error handling for the blockrelay workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`RelayError`] and the [`Result`] alias
//! - **Types**: [`Block`], [`BlockHash`] and the provenance [`SourceTag`]
//! - **Logging**: `tracing` subscriber setup shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use blockrelay_common::{Block, Result};
//!
//! fn describe(raw: &[u8]) -> Result<()> {
//!     let block = Block::from_slice(raw)?;
//!     tracing::info!(height = block.height, hash = %block.hash, "decoded block");
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{RelayError, Result};
pub use types::{Block, BlockHash, SourceTag};

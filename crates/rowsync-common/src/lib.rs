//! Rowsync Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, logging bootstrap and error handling for the rowsync workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`RowsyncError`] and the [`Result`] alias
//! - **Logging**: [`logging::init_logging`] driven by `LOG_*` environment variables
//! - **Types**: [`types::FileRef`], the identity of one logical import file
//!
//! # Example
//!
//! ```no_run
//! use rowsync_common::logging::{init_logging, LogConfig};
//! use rowsync_common::types::FileRef;
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging(&LogConfig::from_env()?)?;
//!
//!     let file = FileRef::new("contacts_csv", 42);
//!     tracing::info!(file = %file, "Import registered");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{Result, RowsyncError};
pub use types::FileRef;

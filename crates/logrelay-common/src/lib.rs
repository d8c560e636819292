//! Logrelay Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling and logging setup for the logrelay workspace.
//!
//! - **Error Handling**: [`RelayError`] and the [`Result`] alias
//! - **Logging**: centralized `tracing` subscriber configuration
//!
//! # Example
//!
//! ```no_run
//! use logrelay_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     let _guard = init_logging(&config)?;
//!     tracing::info!("worker starting");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;

pub use error::{RelayError, Result};

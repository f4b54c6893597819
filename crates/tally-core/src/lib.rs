//! # tally-core
//!
//! Shared plumbing for the tally crates.
//!
//! This crate provides:
//! - [`TallyError`] - Errors for configuration, filesystem and logging setup
//! - [`logging`] - Tracing setup and default log locations
//!
//! ## Example
//!
//! ```no_run
//! fn main() -> tally_core::Result<()> {
//!     let _guard = tally_core::init_logging(None, false)?;
//!     tracing::info!(home = %tally_core::logging::tally_home()?.display(), "ready");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;

pub use error::{Result, TallyError};
pub use logging::{LogGuard, init_logging};

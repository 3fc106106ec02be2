//! # Carebot Core
//!
//! Configuration, error type, shared types and capability traits used by
//! every other Carebot crate.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::CarebotConfig;
pub use error::{CarebotError, Result};

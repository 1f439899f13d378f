//! Brickyard library crate.

/// Core library modules and APIs.
pub mod core;

/// CLI argument parsing and adapters (only when the `cli` feature is enabled).
#[cfg(feature = "cli")]
pub mod cli;

mod config;
mod error;

pub use config::*;
pub use error::*;

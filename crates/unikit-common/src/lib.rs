//! Shared foundation for the unikit workspace.
//!
//! Holds the error ladder, domain primitive types (platforms, architectures,
//! machine states), the cooperative cancellation [`ctx::Context`], byte
//! quantity parsing, the machine name generator, and runtime configuration.

pub mod config;
pub mod constants;
pub mod ctx;
pub mod error;
pub mod namegen;
pub mod quantity;
pub mod types;

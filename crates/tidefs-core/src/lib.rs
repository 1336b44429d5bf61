//! tidefs-core: shared types, config schema, and error types
//!
//! Everything here is dependency-light so that every other tidefs crate can
//! depend on it without pulling in crypto or transport stacks.

pub mod config;
pub mod error;
pub mod types;

pub use error::{TidefsError, TidefsResult};
pub use types::{FileId, FileKind};

//! Shared types for the warehouse dashboard workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;

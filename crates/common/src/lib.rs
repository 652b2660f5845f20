//! Shared types for the CRM auth gateway crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;

// src/utils/mod.rs

pub mod error;
pub mod helpers;
pub mod logger;

// Re-export commonly used items
pub use error::{ErrorKind, GovernorError, GovernorResult};
pub use helpers::*;
pub use logger::*;

pub mod config;
pub mod error;
pub mod types;

pub use config::WorkqConfig;
pub use error::{Result, WorkqError};
pub use types::*;

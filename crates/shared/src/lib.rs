pub mod models;
pub mod error;
pub mod config;
pub mod logging;

pub use config::VerificationConfig;
pub use error::{Error, Result};
pub use models::{Connection, Identity, VerificationMethod};

pub mod config;
pub mod logging;
pub mod secure_storage;

pub use config::{CredentialSource, KeelConfig};
pub use secure_storage::SecureStorage;

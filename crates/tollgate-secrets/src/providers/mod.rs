//! Built-in secret providers.

pub mod env;
pub mod local;
pub mod vault;

pub use env::EnvProvider;
pub use local::{LocalProvider, MasterKeySource, generate_master_key};
pub use vault::{VaultAuth, VaultProvider};

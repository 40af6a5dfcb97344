//! memvault - Client-side encrypted vault storage engine
//!
//! A vault is a JSON document sealed into a self-describing binary container
//! (AES-256-GCM under a PBKDF2-derived key). Containers are persisted through
//! pluggable storage adapters, guarded by a chunked integrity manifest, and
//! the expensive crypto can run on a pool of worker threads.

pub mod config;
pub mod container;
pub mod crypto;
pub mod error;
pub mod integrity;
pub mod keyring;
pub mod session;
pub mod storage;
pub mod store;
pub mod worker;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::container::{ContainerCodec, VaultDocument};
    pub use crate::error::{Error, Result};
    pub use crate::keyring::Keyring;
    pub use crate::session::VaultSession;
    pub use crate::storage::StorageAdapter;
}

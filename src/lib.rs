//! relay-sync: keep directories of several machines in sync through a
//! storage location that only knows how to store files.
//!
//! Clients never talk to each other. Everything they need to agree on
//! (locks, versions, who already pulled what) lives in special files next
//! to the data on the relay; see [`relay`].

pub mod backend;
pub mod cipher;
pub mod clock;
pub mod config;
pub mod error;
pub mod manager;
pub mod notify;
pub mod quota;
pub mod relay;
pub mod supervisor;

pub use config::{Config, RepositoryConfig};
pub use error::{Result, SyncError};

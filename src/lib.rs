//! # pan115-rust-sdk
//!
//! Client SDK for the 115 cloud-storage service: session transport over
//! the service's JSON API, the cryptographic envelopes its privileged
//! endpoints require, the dedup/multipart upload pipeline against the
//! Aliyun-compatible storage backend, and a POSIX-like filesystem
//! facade over the id-addressed file tree.
//!
//! The API is fully async (tokio); a [`Client`] is re-entrant and may
//! be shared across tasks. Typical use goes through [`FileSystem`]:
//!
//! ```ignore
//! let fs = pan115_rust_sdk::new_filesystem("UID=...; CID=...; SEID=...")?;
//! let id = fs.resolve_path("/backups/2024").await?;
//! let (children, total) = fs.list(id, 32, 0).await?;
//! ```

pub mod api;
pub mod client;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod fs;
pub mod oss;
pub mod upload;
pub mod utils;

use std::sync::Arc;

pub use client::Client;
pub use error::Error;
pub use fs::FileSystem;

/// Builds a shared client from a `UID`/`CID`/`SEID` cookie string.
pub fn new_client(cookies: &str) -> Result<Arc<Client>, Error> {
    Ok(Arc::new(Client::new(cookies)?))
}

/// Builds a filesystem facade over a fresh client.
pub fn new_filesystem(cookies: &str) -> Result<FileSystem, Error> {
    Ok(FileSystem::new(new_client(cookies)?))
}

/// Builds a filesystem from the `PAN115_COOKIES` environment variable.
pub fn filesystem_from_env() -> Result<FileSystem, Error> {
    Ok(FileSystem::new(Arc::new(Client::from_env()?)))
}

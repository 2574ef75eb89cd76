//! # cryptmeta - Encrypted Filesystem Metadata
//!
//! cryptmeta persists the user, group and directory-entry registries of an
//! encrypted filesystem and enforces an owner/group/other permission model
//! over directory entries ("dirents").
//!
//! ## Features
//!
//! - **Metadata sections**: self-describing `{count, version}` header followed
//!   by one JSON record per line; several sections share one stream
//! - **Generic codec**: any [`metadata::Record`] (users, groups, dirents)
//!   uses the same read/write routines
//! - **Encrypted container**: chunked XChaCha20-Poly1305 with truncation and
//!   reordering detection
//! - **Permissions**: create/update/read checks composed as owner bit OR
//!   group bit OR other bit
//!
//! ## Quick Start
//!
//! ```no_run
//! use cryptmeta::dirent::{DirentKind, Permissions};
//! use cryptmeta::key_manager::KeyManager;
//! use cryptmeta::store::{MetadataStore, ROOT_DIRENT, ROOT_USER};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let km = KeyManager::load_or_generate("./cryptmeta.key").await?;
//!     let mut store = MetadataStore::new(&km, "./metadata.enc");
//!     store.init_root()?;
//!
//!     let alice = store.add_user("alice")?;
//!     let home = store.create_dirent(
//!         ROOT_USER,
//!         ROOT_DIRENT,
//!         "home",
//!         DirentKind::Directory,
//!         Permissions::from_mode(0o755),
//!     )?;
//!
//!     // alice may read /home but not create inside it
//!     store.check_read(alice, home)?;
//!     assert!(store.check_create(alice, home).is_err());
//!
//!     store.save().await?;
//!     Ok(())
//! }
//! ```

pub mod cipherio;
pub mod config;
pub mod dirent;
pub mod error;
pub mod identity;
pub mod key_manager;
pub mod metadata;
pub mod permissions;
pub mod store;

// Re-export common types for convenience
pub use error::{CipherError, MetadataError, PermissionsError, StoreError};

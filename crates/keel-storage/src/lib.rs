//! Keel Storage — the persistence collaborators of the plugin subsystem.
//!
//! Three narrow async interfaces, each with an in-memory and a file-backed
//! implementation:
//!
//! # [`KvStore`]
//!
//! Namespaced byte-level `put`/`get`/`list`/`delete`. Backs the plugin info store.
//! [`ScopedKvStore`] pre-binds a namespace and adds JSON helpers.
//!
//! # [`BlobStore`]
//!
//! Path-addressed blobs (`read`/`create`/`update`/`upsert`/`delete`/
//! `list_paths`/`exists`). Models the shared remote package repository.
//! [`ReadOnlyBlobStore`] wraps any store and rejects writes.
//!
//! # [`SessionCache`]
//!
//! A TTL cache with an atomic insert-if-absent primitive. Backs the
//! distributed ephemeral lock. [`MemorySessionCache`] is process-local;
//! [`FileSessionCache`] is shared by every process that points at the same
//! directory.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod blob;
pub mod error;
mod fs_util;
pub mod kv;
pub mod session;

pub use blob::{BlobStore, FileBlobStore, MemoryBlobStore, ReadOnlyBlobStore};
pub use error::{StorageError, StorageResult};
pub use kv::{FileKvStore, KvStore, MemoryKvStore, ScopedKvStore};
pub use session::{FileSessionCache, MemorySessionCache, SessionCache};

//! Storage traits and implementations
//!
//! Two boundaries live here: the [`Datastore`] for structured records
//! (users, projects, ingested messages, grants) and the [`BlobStore`] for
//! message content. Each has an in-memory implementation for tests and a
//! persistent one for the binary.

mod blob;
mod blob_file;
mod cipher;
mod memory;
mod sqlite;
mod traits;

pub use blob::{BlobStore, InMemoryBlobStore, attachment_key, content_key, sanitize_filename};
pub use blob_file::FileBlobStore;
pub use cipher::{BlobCipher, CipherError};
pub use memory::InMemoryDatastore;
pub use sqlite::SqliteDatastore;
pub use traits::Datastore;

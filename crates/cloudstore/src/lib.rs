//! Cloudstore - File-like access to blob stores through a local cache
//!
//! Provides:
//! - Random-access read/write handles backed by a scratch file, uploaded on close
//! - Paginated, optionally sorted listings with synthesized folders
//! - Streaming readers/writers, copy and move between stores
//! - Local filesystem and in-memory backends (S3 with the `s3` feature)
//! - A startup sweep for scratch files orphaned by a crashed process
//!
//! # Example
//!
//! ```no_run
//! use cloudstore::{AccessMode, OpContext, Query, Store, StoreConfig};
//! use tokio::io::AsyncWriteExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Store::from_config(&StoreConfig::local("/tmp/blobs", "/tmp/blobs-cache")).await?;
//! let ctx = OpContext::background();
//!
//! let object = store.new_object(&ctx, "reports/2024.csv").await?;
//! let mut handle = object.open(&ctx, AccessMode::ReadWrite).await?;
//! handle.write_all(b"a,b,c\n").await?;
//! handle.close(&ctx).await?;
//!
//! let listing = store.list(&ctx, &Query::for_folders("reports/")).await?;
//! assert_eq!(listing.objects.len(), 1);
//! # Ok(())
//! # }
//! ```

mod backend;
mod cache;
mod folders;
mod local;
mod memory;
mod object;
mod query;
mod store;
mod stream;
mod transfer;

#[cfg(feature = "s3")]
mod s3;

pub use backend::{BlobReader, BlobSink, StorageBackend};
pub use cache::{sweep, sweep_blocking, CacheFile, CacheFiles, SweepReport};
pub use folders::{folder_for_key, synthesize_folders, FolderSet};
pub use local::LocalStorage;
pub use memory::MemoryStorage;
pub use object::{Object, ObjectHandle};
pub use query::{ListResponse, ObjectIterator, PageDriver, Query};
pub use store::Store;
pub use stream::{ObjectReader, ObjectWriter};
pub use transfer::{copy, move_object};

#[cfg(feature = "s3")]
pub use s3::{S3Config, S3Storage};

pub use cloudstore_core::{
    AccessMode, BackendConfig, CacheConfig, Cursor, Error, ListPage, ListRequest, ObjectMeta,
    ObjectName, OpContext, Result, StoreConfig, DEFAULT_DELIMITER, DEFAULT_PAGE_SIZE,
};

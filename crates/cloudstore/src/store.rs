//! Store facade: one backend, one scratch directory

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cloudstore_core::{
    BackendConfig, Error, ObjectMeta, OpContext, Result, StoreConfig, DEFAULT_DELIMITER,
    DEFAULT_PAGE_SIZE,
};
use tracing::{info, instrument};

use crate::backend::StorageBackend;
use crate::cache::{self, CacheFiles, SweepReport};
use crate::local::LocalStorage;
use crate::memory::MemoryStorage;
use crate::object::{Object, ObjectSource};
use crate::query::{collect_pages, ListResponse, ObjectIterator, PageDriver, Query};
use crate::stream::{ObjectReader, ObjectWriter};

/// Handle to one backend instance
///
/// Cheap to clone; clones share the backend and the scratch directory.
#[derive(Clone)]
pub struct Store {
    source: ObjectSource,
    page_size: usize,
    cache_max_age: Duration,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("backend", &self.source.backend.backend_type())
            .field("location", &self.source.backend.location())
            .field("cache_dir", &self.source.cache.dir())
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl fmt::Display for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source.backend.location())
    }
}

impl Store {
    /// Wrap a backend, keeping scratch files under `cache_dir`
    pub fn new(backend: Arc<dyn StorageBackend>, cache_dir: impl AsRef<Path>) -> Self {
        Self {
            source: ObjectSource {
                backend,
                cache: Arc::new(CacheFiles::new(cache_dir.as_ref())),
            },
            page_size: DEFAULT_PAGE_SIZE,
            cache_max_age: cloudstore_core::CacheConfig::default().max_age,
        }
    }

    /// Default page size for queries that don't set one
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Build the backend a configuration selects
    ///
    /// Runs the scratch-file sweep first when `cache.sweep_on_start` is set.
    pub async fn from_config(config: &StoreConfig) -> Result<Self> {
        config.validate()?;

        let backend: Arc<dyn StorageBackend> = match &config.backend {
            BackendConfig::Local { root } => Arc::new(LocalStorage::create(root).await?),
            BackendConfig::Memory => Arc::new(MemoryStorage::new()),
            #[cfg(feature = "s3")]
            BackendConfig::S3 {
                bucket,
                prefix,
                endpoint,
                region,
                force_path_style,
            } => Arc::new(
                crate::s3::S3Storage::with_config(crate::s3::S3Config {
                    bucket: bucket.clone(),
                    prefix: prefix.clone(),
                    endpoint_url: endpoint.clone(),
                    region: region.clone(),
                    force_path_style: *force_path_style,
                })
                .await,
            ),
            #[cfg(not(feature = "s3"))]
            BackendConfig::S3 { .. } => {
                return Err(Error::InvalidConfig {
                    message: "s3 backend requested but the `s3` feature is not enabled".to_string(),
                })
            }
        };

        let mut store = Self::new(backend, &config.cache.dir).with_page_size(config.page_size);
        store.cache_max_age = config.cache.max_age;

        if config.cache.sweep_on_start {
            store.sweep_cache().await?;
        }

        info!(store = %store, backend = store.backend_type(), "Store ready");
        Ok(store)
    }

    /// Backend family identifier, e.g. "localfs" or "s3"
    pub fn backend_type(&self) -> &'static str {
        self.source.backend.backend_type()
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.source.backend
    }

    pub fn cache_dir(&self) -> &Path {
        self.source.cache.dir()
    }

    /// Look up an existing object
    ///
    /// # Errors
    /// `NotFound` if the object doesn't exist
    #[instrument(skip(self, ctx), fields(backend = self.backend_type()))]
    pub async fn get(&self, ctx: &OpContext, name: &str) -> Result<Object> {
        validate_name(name)?;
        let meta = ctx.run("get", self.source.backend.head(name)).await?;
        Ok(self.source.existing(meta))
    }

    /// Reference to an object that does not exist yet
    ///
    /// The object is created when a handle opened on it is closed.
    ///
    /// # Errors
    /// `AlreadyExists` if an object with this name is stored; the stored
    /// content is left untouched
    #[instrument(skip(self, ctx), fields(backend = self.backend_type()))]
    pub async fn new_object(&self, ctx: &OpContext, name: &str) -> Result<Object> {
        validate_name(name)?;
        match ctx.run("new_object", self.source.backend.head(name)).await {
            Ok(_) => Err(Error::AlreadyExists {
                name: name.to_string(),
            }),
            Err(e) if e.is_not_found() => Ok(self.source.fresh(name)),
            Err(e) => Err(e),
        }
    }

    /// Delete a stored object
    ///
    /// Backends with eventually consistent deletes may keep listing the
    /// object for a while.
    ///
    /// # Errors
    /// `NotFound` if the object doesn't exist
    #[instrument(skip(self, ctx), fields(backend = self.backend_type()))]
    pub async fn delete(&self, ctx: &OpContext, name: &str) -> Result<()> {
        validate_name(name)?;
        ctx.run("delete", self.source.backend.delete(name)).await?;
        info!(%name, "Deleted object");
        Ok(())
    }

    /// Lazily enumerate the objects a query matches
    pub fn objects(&self, ctx: &OpContext, query: Query) -> ObjectIterator {
        let sorted = query.sorted;
        let driver = self.driver(ctx, &query);
        ObjectIterator::new(driver, self.source.clone(), sorted)
    }

    /// Enumerate a query into one batch
    ///
    /// Drains every page unless `query.max_results` is set, in which case it
    /// stops at the first page boundary past the cap and reports where to
    /// resume. A sorted query on a backend that only orders within a page
    /// ignores the cap and drains everything, so the result is always in
    /// key order.
    #[instrument(skip(self, ctx), fields(backend = self.backend_type()))]
    pub async fn list(&self, ctx: &OpContext, query: &Query) -> Result<ListResponse> {
        let mut driver = self.driver(ctx, query);
        let collected = collect_pages(
            &mut driver,
            &query.prefix,
            query.delimiter.as_deref(),
            query.sorted,
            query.max_results,
        )
        .await?;

        Ok(ListResponse {
            objects: collected
                .objects
                .into_iter()
                .map(|meta| self.source.existing(meta))
                .collect(),
            folders: collected.folders,
            is_truncated: collected.next_cursor.is_some(),
            next_cursor: collected.next_cursor,
        })
    }

    /// Immediate child folders under `query.prefix`
    ///
    /// Uses '/' when the query has no delimiter. Sorted when the query is.
    #[instrument(skip(self, ctx), fields(backend = self.backend_type()))]
    pub async fn folders(&self, ctx: &OpContext, query: &Query) -> Result<Vec<String>> {
        let mut query = query.clone();
        query.max_results = None;
        if query.delimiter.is_none() {
            query.delimiter = Some(DEFAULT_DELIMITER.to_string());
        }

        let mut driver = self.driver(ctx, &query);
        let collected = collect_pages(
            &mut driver,
            &query.prefix,
            query.delimiter.as_deref(),
            query.sorted,
            None,
        )
        .await?;
        Ok(collected.folders)
    }

    /// Stream an object without a scratch file
    ///
    /// # Errors
    /// `NotFound` if the object doesn't exist
    pub async fn new_reader(&self, ctx: &OpContext, name: &str) -> Result<ObjectReader> {
        validate_name(name)?;
        let inner = ctx
            .run("open_read", self.source.backend.open_read(name))
            .await?;
        Ok(ObjectReader::new(name, inner))
    }

    /// Stream bytes into an object without a scratch file
    ///
    /// The object is replaced when the writer is closed.
    pub async fn new_writer(&self, ctx: &OpContext, name: &str) -> Result<ObjectWriter> {
        validate_name(name)?;
        let sink = ctx
            .run("open_write", self.source.backend.open_write(name))
            .await?;
        Ok(ObjectWriter::new(name, sink, ctx.clone()))
    }

    /// Read a whole object into memory
    pub async fn get_bytes(&self, ctx: &OpContext, name: &str) -> Result<bytes::Bytes> {
        validate_name(name)?;
        ctx.run("get_bytes", self.source.backend.get(name)).await
    }

    /// Replace an object with `data` in one call
    pub async fn put_bytes(&self, ctx: &OpContext, name: &str, data: bytes::Bytes) -> Result<ObjectMeta> {
        validate_name(name)?;
        ctx.run("put_bytes", self.source.backend.put(name, data)).await
    }

    /// Reclaim scratch files orphaned by a crashed process
    ///
    /// Uses the configured age threshold, see [`cache::sweep_blocking`].
    pub async fn sweep_cache(&self) -> Result<SweepReport> {
        cache::sweep(self.cache_dir(), self.cache_max_age).await
    }

    fn driver(&self, ctx: &OpContext, query: &Query) -> PageDriver {
        PageDriver::new(
            Arc::clone(&self.source.backend),
            query,
            self.page_size,
            ctx.clone(),
        )
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidKey {
            name: name.to_string(),
            reason: "empty key".to_string(),
        });
    }
    Ok(())
}

//! In-memory storage backend
//!
//! Keeps objects in a process-local map. Listings come back in insertion
//! order, sorted only within each page, the way several remote stores
//! page their results.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Duration, Utc};
use cloudstore_core::{Error, ListPage, ListRequest, ObjectMeta, Result};
use parking_lot::RwLock;
use tracing::{debug, instrument};

use crate::backend::{BlobReader, BlobSink, StorageBackend};
use crate::folders::folder_for_key;

const BACKEND: &str = "memory";

#[derive(Debug, Clone)]
struct Entry {
    data: Bytes,
    updated: DateTime<Utc>,
    /// Insertion sequence, used as the listing cursor
    seq: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    objects: HashMap<String, Entry>,
    next_seq: u64,
}

/// In-memory storage backend, cheap to clone (clones share contents)
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.state.read().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn commit(&self, name: &str, data: Bytes) -> ObjectMeta {
        let mut state = self.state.write();
        let now = Utc::now();

        let (seq, updated) = match state.objects.get(name) {
            // Overwrites keep their listing position; timestamps never go backwards
            Some(prev) => (prev.seq, now.max(prev.updated + Duration::microseconds(1))),
            None => {
                let seq = state.next_seq;
                state.next_seq += 1;
                (seq, now)
            }
        };

        let size = data.len() as u64;
        state.objects.insert(name.to_string(), Entry { data, updated, seq });

        ObjectMeta {
            name: name.to_string(),
            size,
            updated,
        }
    }
}

fn meta_for(name: &str, entry: &Entry) -> ObjectMeta {
    ObjectMeta {
        name: name.to_string(),
        size: entry.data.len() as u64,
        updated: entry.updated,
    }
}

fn validate_key(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidKey {
            name: name.to_string(),
            reason: "empty key".to_string(),
        });
    }
    Ok(())
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    fn backend_type(&self) -> &'static str {
        BACKEND
    }

    fn location(&self) -> String {
        "memory://".to_string()
    }

    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn head(&self, name: &str) -> Result<ObjectMeta> {
        let state = self.state.read();
        state
            .objects
            .get(name)
            .map(|entry| meta_for(name, entry))
            .ok_or_else(|| Error::not_found(name))
    }

    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn open_read(&self, name: &str) -> Result<BlobReader> {
        let data = self
            .state
            .read()
            .objects
            .get(name)
            .map(|entry| entry.data.clone())
            .ok_or_else(|| Error::not_found(name))?;
        Ok(Box::new(Cursor::new(data)))
    }

    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn open_write(&self, name: &str) -> Result<Box<dyn BlobSink>> {
        validate_key(name)?;
        Ok(Box::new(MemorySink {
            storage: self.clone(),
            name: name.to_string(),
            buffer: BytesMut::new(),
        }))
    }

    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn delete(&self, name: &str) -> Result<()> {
        self.state
            .write()
            .objects
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(name))
    }

    #[instrument(skip(self, request), fields(backend = BACKEND, prefix = %request.prefix))]
    async fn list_page(&self, request: &ListRequest) -> Result<ListPage> {
        let after = match &request.cursor {
            Some(cursor) => Some(cursor.parse::<u64>().map_err(|_| Error::InvalidState {
                message: format!("malformed listing cursor {:?}", cursor),
            })?),
            None => None,
        };

        let state = self.state.read();
        let mut matching: Vec<(u64, ObjectMeta)> = state
            .objects
            .iter()
            .filter(|(name, entry)| {
                name.starts_with(&request.prefix) && after.map_or(true, |after| entry.seq > after)
            })
            .map(|(name, entry)| (entry.seq, meta_for(name, entry)))
            .collect();
        drop(state);

        matching.sort_by_key(|(seq, _)| *seq);

        let page_size = request.page_size.max(1);
        let has_more = matching.len() > page_size;
        matching.truncate(page_size);

        let mut page = ListPage {
            next_cursor: if has_more {
                matching.last().map(|(seq, _)| seq.to_string())
            } else {
                None
            },
            ..Default::default()
        };

        for (_, meta) in matching {
            let folder = request
                .delimiter
                .as_deref()
                .and_then(|delim| folder_for_key(&request.prefix, delim, &meta.name));
            match folder {
                Some(folder) => {
                    if !page.common_prefixes.contains(&folder) {
                        page.common_prefixes.push(folder);
                    }
                }
                None => page.objects.push(meta),
            }
        }
        page.objects.sort_by(|a, b| a.name.cmp(&b.name));

        debug!(
            objects = page.objects.len(),
            more = page.next_cursor.is_some(),
            "Listed page"
        );
        Ok(page)
    }
}

/// Upload buffered in memory until finished
struct MemorySink {
    storage: MemoryStorage,
    name: String,
    buffer: BytesMut,
}

#[async_trait]
impl BlobSink for MemorySink {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        self.buffer.extend_from_slice(&chunk);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<ObjectMeta> {
        let MemorySink {
            storage,
            name,
            buffer,
        } = *self;
        Ok(storage.commit(&name, buffer.freeze()))
    }
}

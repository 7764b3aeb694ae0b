//! Listing queries and the pagination driver behind them
//!
//! A [`Query`] is consumed either eagerly (`Store::list`, one batch) or
//! lazily (`Store::objects`, an [`ObjectIterator`]). Both pull pages through
//! the same [`PageDriver`], so both see the same normalized result set.

use std::collections::VecDeque;
use std::sync::Arc;

use cloudstore_core::{
    Cursor, Error, ListPage, ListRequest, ObjectMeta, OpContext, Result, DEFAULT_DELIMITER,
};
use tracing::{debug, trace};

use crate::backend::StorageBackend;
use crate::folders::{folder_for_key, FolderSet};
use crate::object::{Object, ObjectSource};

/// Immutable description of a listing request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    /// Keys must start with this prefix
    pub prefix: String,

    /// Folder boundary; when set only immediate children are listed
    pub delimiter: Option<String>,

    /// Yield results in ascending key order
    pub sorted: bool,

    /// Page size hint, the store default applies when unset
    pub page_size: Option<usize>,

    /// Resume a listing from a cursor returned earlier
    pub cursor: Option<Cursor>,

    /// Stop an eager listing at the first page boundary past this many objects
    pub max_results: Option<usize>,
}

impl Query {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Default::default()
        }
    }

    /// Every object in the store
    pub fn all() -> Self {
        Self::default()
    }

    /// Immediate child folders of `prefix`, sorted, '/'-delimited
    pub fn for_folders(prefix: impl Into<String>) -> Self {
        Self::new(prefix)
            .with_delimiter(DEFAULT_DELIMITER)
            .sorted()
    }

    pub fn sorted(mut self) -> Self {
        self.sorted = true;
        self
    }

    /// An empty delimiter disables folder collapsing
    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        let delimiter = delimiter.into();
        self.delimiter = if delimiter.is_empty() {
            None
        } else {
            Some(delimiter)
        };
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size.max(1));
        self
    }

    pub fn with_cursor(mut self, cursor: impl Into<Cursor>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = Some(max_results);
        self
    }

    pub(crate) fn to_request(&self, default_page_size: usize) -> ListRequest {
        ListRequest {
            prefix: self.prefix.clone(),
            delimiter: self.delimiter.clone(),
            cursor: self.cursor.clone(),
            page_size: self.page_size.unwrap_or(default_page_size).max(1),
        }
    }
}

/// Result of an eager listing
#[derive(Debug, Clone, Default)]
pub struct ListResponse {
    /// Objects in key order when the query was sorted
    pub objects: Vec<Object>,

    /// Immediate child folders, when the query had a delimiter
    pub folders: Vec<String>,

    /// Where to resume when the listing stopped early
    pub next_cursor: Option<Cursor>,

    /// True when more results exist past `next_cursor`
    pub is_truncated: bool,
}

/// Fetches backend pages one by one and normalizes them
///
/// Normalization keeps only keys under the prefix and, when a delimiter is
/// set, moves keys below the next delimiter into the page's common
/// prefixes. Backends that ignore the delimiter therefore look identical to
/// ones that honor it.
pub struct PageDriver {
    backend: Arc<dyn StorageBackend>,
    request: ListRequest,
    ctx: OpContext,
    exhausted: bool,
    pages: usize,
}

impl PageDriver {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        query: &Query,
        default_page_size: usize,
        ctx: OpContext,
    ) -> Self {
        Self {
            backend,
            request: query.to_request(default_page_size),
            ctx,
            exhausted: false,
            pages: 0,
        }
    }

    /// Whether the backend guarantees key order across pages
    pub fn backend_sorted(&self) -> bool {
        self.backend.lists_sorted()
    }

    /// Cursor the next page will be requested with
    pub fn cursor(&self) -> Option<&Cursor> {
        if self.exhausted {
            None
        } else {
            self.request.cursor.as_ref()
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages
    }

    /// Fetch the next page, `None` once the listing is exhausted
    pub async fn next_page(&mut self) -> Result<Option<ListPage>> {
        if self.exhausted {
            return Ok(None);
        }

        let backend = Arc::clone(&self.backend);
        let raw = self
            .ctx
            .run("list", backend.list_page(&self.request))
            .await?;
        self.pages += 1;

        match raw.next_cursor.as_ref() {
            Some(next) if self.request.cursor.as_ref() == Some(next) => {
                return Err(Error::remote(
                    self.backend.backend_type(),
                    format!("listing cursor {:?} did not advance", next),
                ));
            }
            Some(next) => self.request.cursor = Some(next.clone()),
            None => self.exhausted = true,
        }

        let page = self.normalize(raw);
        trace!(
            page = self.pages,
            objects = page.objects.len(),
            prefixes = page.common_prefixes.len(),
            "Fetched listing page"
        );
        Ok(Some(page))
    }

    fn normalize(&self, raw: ListPage) -> ListPage {
        let prefix = &self.request.prefix;
        let mut page = ListPage {
            next_cursor: raw.next_cursor,
            ..Default::default()
        };

        let Some(delimiter) = self.request.delimiter.as_deref() else {
            page.objects = raw
                .objects
                .into_iter()
                .filter(|meta| meta.name.starts_with(prefix.as_str()))
                .collect();
            return page;
        };

        let mut folders = FolderSet::new(prefix.clone(), delimiter);
        for common_prefix in &raw.common_prefixes {
            folders.add_common_prefix(common_prefix);
        }
        for meta in raw.objects {
            if !meta.name.starts_with(prefix.as_str()) {
                continue;
            }
            match folder_for_key(prefix, delimiter, &meta.name) {
                Some(_) => folders.add_key(&meta.name),
                None => page.objects.push(meta),
            }
        }
        page.common_prefixes = folders.into_vec(false);
        page
    }
}

/// Objects and folders collected by draining a driver
pub(crate) struct Collected {
    pub objects: Vec<ObjectMeta>,
    pub folders: Vec<String>,
    pub next_cursor: Option<Cursor>,
}

/// Drain pages until exhausted or until `max_results` objects are in hand
pub(crate) async fn collect_pages(
    driver: &mut PageDriver,
    prefix: &str,
    delimiter: Option<&str>,
    sorted: bool,
    max_results: Option<usize>,
) -> Result<Collected> {
    // A sorted batch cut at a page boundary is only ordered across batches
    // when the backend orders across pages
    let max_results = if sorted && !driver.backend_sorted() {
        None
    } else {
        max_results
    };

    let mut objects = Vec::new();
    let mut folders = FolderSet::new(prefix, delimiter.unwrap_or_default());

    while let Some(page) = driver.next_page().await? {
        objects.extend(page.objects);
        for common_prefix in &page.common_prefixes {
            folders.add_common_prefix(common_prefix);
        }
        if max_results.is_some_and(|max| objects.len() >= max) {
            break;
        }
    }

    if sorted {
        objects.sort_by(|a, b| a.name.cmp(&b.name));
    }

    debug!(
        objects = objects.len(),
        folders = folders.len(),
        pages = driver.pages_fetched(),
        truncated = !driver.is_exhausted(),
        "Collected listing"
    );

    Ok(Collected {
        objects,
        folders: folders.into_vec(sorted),
        next_cursor: driver.cursor().cloned(),
    })
}

/// Lazy, single-pass sequence of objects spanning every page
///
/// `next` yields `Ok(Some(object))` per object and `Ok(None)` once the
/// listing is done. After an error the iterator is finished. Build a fresh
/// query to enumerate again.
///
/// When a sorted query runs against a backend that only orders within a
/// page, the first call drains every page and sorts before yielding.
pub struct ObjectIterator {
    driver: PageDriver,
    source: ObjectSource,
    buffer: VecDeque<ObjectMeta>,
    sorted: bool,
    merge_all: bool,
    done: bool,
}

impl ObjectIterator {
    pub(crate) fn new(driver: PageDriver, source: ObjectSource, sorted: bool) -> Self {
        let merge_all = sorted && !driver.backend_sorted();
        Self {
            driver,
            source,
            buffer: VecDeque::new(),
            sorted,
            merge_all,
            done: false,
        }
    }

    /// Next object, or `None` when the sequence is done
    pub async fn next(&mut self) -> Result<Option<Object>> {
        loop {
            if let Some(meta) = self.buffer.pop_front() {
                return Ok(Some(self.source.existing(meta)));
            }
            if self.done {
                return Ok(None);
            }

            match self.fill().await {
                Ok(()) => {}
                Err(e) => {
                    self.done = true;
                    self.buffer.clear();
                    return Err(e);
                }
            }
        }
    }

    async fn fill(&mut self) -> Result<()> {
        if self.merge_all {
            let mut all = Vec::new();
            while let Some(page) = self.driver.next_page().await? {
                all.extend(page.objects);
            }
            all.sort_by(|a, b| a.name.cmp(&b.name));
            self.buffer.extend(all);
            self.done = true;
            return Ok(());
        }

        match self.driver.next_page().await? {
            Some(mut page) => {
                if self.sorted {
                    page.objects.sort_by(|a, b| a.name.cmp(&b.name));
                }
                self.buffer.extend(page.objects);
            }
            None => self.done = true,
        }
        Ok(())
    }

    /// Drain the remaining sequence into a vector
    pub async fn collect_all(mut self) -> Result<Vec<Object>> {
        let mut objects = Vec::new();
        while let Some(object) = self.next().await? {
            objects.push(object);
        }
        Ok(objects)
    }
}

//! Owner-id ranged paging over the post meta table.

use tracing::{debug, warn};

use crate::store::{MetaStore, MetadataRecord};

/// Keys with this prefix are internal (ACF field references, WordPress
/// bookkeeping) and are never inspected.
pub(crate) const INTERNAL_KEY_PREFIX: char = '_';

pub(crate) const DEFAULT_CHUNK_SIZE: u64 = 1000;

#[derive(Debug, Clone)]
pub(crate) struct Page {
    /// Exclusive lower bound of the owner-id range.
    pub(crate) offset: u64,
    pub(crate) chunk_size: u64,
    pub(crate) records: Vec<MetadataRecord>,
}

impl Page {
    /// Owner-id range covered, as `(low, high]`.
    pub(crate) fn range(&self) -> (u64, u64) {
        (self.offset, self.offset.saturating_add(self.chunk_size))
    }
}

/// Records owned by ids in `(offset, offset + chunk_size]`, minus internal keys.
///
/// A failed query is logged and reported as an empty page: callers read it as
/// "no more data".
pub(crate) fn fetch_page<S: MetaStore + ?Sized>(
    store: &S,
    chunk_size: u64,
    offset: u64,
) -> Vec<MetadataRecord> {
    let high = offset.saturating_add(chunk_size);
    let records = match store.range_query(offset, high) {
        Ok(records) => records,
        Err(e) => {
            warn!(offset, chunk_size, error = %e, "post meta query failed; treating as end of data");
            return Vec::new();
        }
    };
    let total = records.len();
    let kept: Vec<MetadataRecord> = records
        .into_iter()
        .filter(|r| !r.key.starts_with(INTERNAL_KEY_PREFIX))
        .collect();
    debug!(offset, high, total, kept = kept.len(), "fetched post meta page");
    kept
}

/// Lazy sequence of pages. Ends, for good, at the first empty page; a sparse
/// page does not end it.
pub(crate) struct Pages<'a, S: MetaStore + ?Sized> {
    store: &'a S,
    chunk_size: u64,
    offset: u64,
    done: bool,
}

impl<'a, S: MetaStore + ?Sized> Pages<'a, S> {
    pub(crate) fn new(store: &'a S, chunk_size: u64) -> Self {
        Self::starting_at(store, chunk_size, 0)
    }

    /// Resume from a persisted offset.
    pub(crate) fn starting_at(store: &'a S, chunk_size: u64, offset: u64) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
            offset,
            done: false,
        }
    }

    /// Offset the next page will be fetched from.
    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }
}

impl<S: MetaStore + ?Sized> Iterator for Pages<'_, S> {
    type Item = Page;

    fn next(&mut self) -> Option<Page> {
        if self.done {
            return None;
        }
        let records = fetch_page(self.store, self.chunk_size, self.offset);
        if records.is_empty() {
            self.done = true;
            return None;
        }
        let page = Page {
            offset: self.offset,
            chunk_size: self.chunk_size,
            records,
        };
        self.offset = self.offset.saturating_add(self.chunk_size);
        Some(page)
    }
}

impl<S: MetaStore + ?Sized> std::iter::FusedIterator for Pages<'_, S> {}

//! Page-backed payload storage.
//!
//! Page contents are only accessible through a [MappedPage] guard. Code that touches page data
//!  maps one page at a time and drops the guard before moving on to the next fragment, and
//!  [MapStats] keeps track of how many pages are mapped at any given time.

use std::fmt::{Debug, Formatter};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use anyhow::bail;
use parking_lot::{Mutex, MutexGuard};

pub const PAGE_SIZE: usize = 4096;

#[derive(Default, Debug)]
pub struct MapStats {
    mapped: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicU64,
}

impl MapStats {
    pub fn currently_mapped(&self) -> usize {
        self.mapped.load(Ordering::Acquire)
    }

    pub fn peak_mapped(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    pub fn total_mappings(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    fn on_map(&self) {
        let now = self.mapped.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
        self.total.fetch_add(1, Ordering::AcqRel);
    }

    fn on_unmap(&self) {
        self.mapped.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct Page {
    data: Mutex<Box<[u8]>>,
    stats: Arc<MapStats>,
}

impl Debug for Page {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Page@{:p}", self)
    }
}

impl Page {
    pub fn new(stats: Arc<MapStats>) -> Page {
        Page {
            data: Mutex::new(vec![0; PAGE_SIZE].into_boxed_slice()),
            stats,
        }
    }

    /// Convenience for code that has data at hand: a page with its own statistics, starting
    ///  with a copy of `data`
    pub fn with_contents(data: &[u8]) -> anyhow::Result<Page> {
        if data.len() > PAGE_SIZE {
            bail!("{} bytes do not fit into a page", data.len());
        }
        Ok(Page::filled(data))
    }

    fn filled(data: &[u8]) -> Page {
        let page = Page::new(Default::default());
        page.data.lock()[..data.len()].copy_from_slice(data);
        page
    }

    /// Makes the page's contents addressable until the returned guard is dropped
    pub fn map(&self) -> MappedPage<'_> {
        let data = self.data.lock();
        self.stats.on_map();
        MappedPage {
            data,
            stats: &self.stats,
        }
    }
}

pub struct MappedPage<'a> {
    data: MutexGuard<'a, Box<[u8]>>,
    stats: &'a MapStats,
}

impl Drop for MappedPage<'_> {
    fn drop(&mut self) {
        self.stats.on_unmap();
    }
}

impl Deref for MappedPage<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for MappedPage<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// A byte range inside a page
#[derive(Clone)]
pub struct PageFrag {
    pub page: Arc<Page>,
    pub offset: usize,
    pub len: usize,
}

impl Debug for PageFrag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}[{}..{}]", self.page, self.offset, self.offset + self.len)
    }
}

impl PageFrag {
    pub fn new(page: Arc<Page>, offset: usize, len: usize) -> anyhow::Result<PageFrag> {
        if offset.checked_add(len).map_or(true, |end| end > PAGE_SIZE) {
            bail!("fragment {}+{} exceeds page", offset, len);
        }
        Ok(PageFrag {
            page,
            offset,
            len,
        })
    }

    /// The first `len` bytes of `page`, for callers that split data into page-sized chunks
    pub(crate) fn leading(page: Arc<Page>, len: usize) -> PageFrag {
        debug_assert!(len <= PAGE_SIZE);
        PageFrag {
            page,
            offset: 0,
            len: len.min(PAGE_SIZE),
        }
    }

    /// Splits `data` into standalone pages, for callers that start out with contiguous memory
    pub fn from_bytes(data: &[u8]) -> Vec<PageFrag> {
        data.chunks(PAGE_SIZE)
            .map(|chunk| PageFrag::leading(Arc::new(Page::filled(chunk)), chunk.len()))
            .collect()
    }

    /// Copies the fragment's contents out, mapping the page for the duration of the copy
    pub fn copy_to(&self, dest: &mut Vec<u8>) {
        let mapped = self.page.map();
        dest.extend_from_slice(&mapped[self.offset..self.offset + self.len]);
    }
}

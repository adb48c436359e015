use std::sync::Arc;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::buffers::page::{MapStats, Page, PageFrag, PAGE_SIZE};

/// Pool of pages for receiving large payloads. Pages are handed out behind an [Arc] because
///  received payloads are passed on to the message handler, and they find their way back to the
///  pool only once nobody references them any longer.
pub struct PagePool {
    pages: Mutex<Vec<Page>>,
    stats: Arc<MapStats>,
}

impl PagePool {
    pub fn new(max_pool_size: usize) -> Self {
        PagePool {
            pages: Mutex::new(Vec::with_capacity(max_pool_size)),
            stats: Default::default(),
        }
    }

    /// Mapping statistics for all pages that originate from this pool
    pub fn stats(&self) -> &MapStats {
        &self.stats
    }

    pub fn get_from_pool(&self) -> Arc<Page> {
        if let Some(page) = self.pages.lock().pop() {
            trace!("returning page from pool");
            return Arc::new(page);
        }

        debug!("no page in pool: creating new page");
        Arc::new(Page::new(self.stats.clone()))
    }

    /// Fragments covering `len` bytes, each starting at the beginning of a fresh page
    pub fn frags_for(&self, len: usize) -> Vec<PageFrag> {
        let mut result = Vec::with_capacity(len.div_ceil(PAGE_SIZE));
        let mut remaining = len;
        while remaining > 0 {
            let frag_len = remaining.min(PAGE_SIZE);
            result.push(PageFrag::leading(self.get_from_pool(), frag_len));
            remaining -= frag_len;
        }
        result
    }

    pub fn return_to_pool(&self, page: Arc<Page>) {
        let page = match Arc::try_unwrap(page) {
            Ok(page) => page,
            Err(_) => {
                trace!("page is still referenced elsewhere: not returning it to the pool");
                return;
            }
        };

        let mut pages = self.pages.lock();
        if pages.capacity() > pages.len() {
            trace!("returning page to pool");
            pages.push(page);
        }
        else {
            debug!("pool is full: discarding returned page");
        }
    }

    pub fn recycle(&self, frags: Vec<PageFrag>) {
        for frag in frags {
            self.return_to_pool(frag.page);
        }
    }

    #[cfg(test)]
    fn pooled(&self) -> usize {
        self.pages.lock().len()
    }
}

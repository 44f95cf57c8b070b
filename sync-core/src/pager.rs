//! Paging window over a topic's cached history.
//!
//! The visible window is `pages_to_load * page_size` messages, newest
//! first. Loading older history either grows the window over rows already
//! in the cache or, once the window covers the whole cache, asks the server
//! for one more page of earlier messages.

/// Default number of messages per page.
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// What to do to show older messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagePlan {
    /// The cache already holds more rows than the window; the window grew.
    GrowFromCache,
    /// Request `limit` messages older than the oldest cached seq.
    FetchRemote {
        /// Page size to request.
        limit: u32,
    },
    /// The server has no older messages and the cache is fully shown.
    Exhausted,
}

/// Paging state for one open topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pager {
    page_size: u32,
    pages_to_load: u32,
}

impl Pager {
    /// Create a pager showing one page. A zero page size is treated as one.
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size: page_size.max(1),
            pages_to_load: 1,
        }
    }

    /// Messages per page.
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Number of pages currently in the window.
    pub fn pages_to_load(&self) -> u32 {
        self.pages_to_load
    }

    /// Number of messages the window covers.
    pub fn window(&self) -> u64 {
        u64::from(self.pages_to_load) * u64::from(self.page_size)
    }

    /// Shrink back to a single page.
    pub fn reset(&mut self) {
        self.pages_to_load = 1;
    }

    /// Decide how to satisfy a request for older messages.
    ///
    /// Grows the window immediately when the plan is
    /// [`PagePlan::GrowFromCache`]. After a remote fetch, call
    /// [`Pager::fetched`] with the number of rows merged.
    pub fn plan_older(&mut self, total_cached: u64, all_loaded: bool) -> PagePlan {
        if self.window() < total_cached {
            self.grow();
            PagePlan::GrowFromCache
        } else if !all_loaded {
            PagePlan::FetchRemote {
                limit: self.page_size,
            }
        } else {
            PagePlan::Exhausted
        }
    }

    /// Record the outcome of a remote fetch.
    pub fn fetched(&mut self, merged: usize) {
        if merged > 0 {
            self.grow();
        }
    }

    fn grow(&mut self) {
        self.pages_to_load = self.pages_to_load.saturating_add(1);
    }
}

impl Default for Pager {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}

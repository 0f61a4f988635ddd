pub mod chapter;
pub mod error;
pub mod loader;
pub mod model;
pub mod observable;
pub mod page;
pub mod queue;
pub mod scope;
pub mod viewer;

#[cfg(test)]
pub(crate) mod testing;

use std::time::Duration;

use crate::backend::config::ReaderConfig;

/// Requested-page value meaning "the last page, whatever the count turns
/// out to be". Clamped once the page list arrives.
pub const LAST_PAGE: usize = usize::MAX;

#[derive(Debug, Clone)]
pub struct ReaderOptions {
    pub max_concurrent_fetches: usize,
    pub prefetch_concurrency: usize,
    pub stall_timeout: Duration,
    pub preload_pages: usize,
    pub prefetch_pages: usize,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 3,
            prefetch_concurrency: 1,
            stall_timeout: Duration::from_secs(30),
            preload_pages: 3,
            prefetch_pages: 2,
        }
    }
}

impl From<&ReaderConfig> for ReaderOptions {
    fn from(config: &ReaderConfig) -> Self {
        Self {
            max_concurrent_fetches: config.max_concurrent_fetches.max(1),
            prefetch_concurrency: config.prefetch_concurrency.max(1),
            stall_timeout: Duration::from_secs(config.stall_timeout_secs.max(1)),
            preload_pages: config.preload_pages,
            prefetch_pages: config.prefetch_pages,
        }
    }
}

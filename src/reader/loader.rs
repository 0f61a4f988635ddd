use futures::future::AbortHandle;
use futures::{FutureExt, StreamExt};
use image::DynamicImage;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::error::{ReaderError, Result};
use super::page::{PageStatus, ReaderPage};
use super::queue::{PageQueue, Urgency};
use super::scope::TaskScope;
use crate::backend::source::{ChapterInfo, ChapterPageSource, ImageDecoder, PageDescriptor};

// Upper bound on the buffer reserved up front from a Content-Length header.
const MAX_PREALLOC: usize = 8 << 20;

pub struct PageLoader {
    shared: Arc<Shared>,
}

struct Shared {
    chapter: ChapterInfo,
    source: Arc<dyn ChapterPageSource>,
    decoder: Arc<dyn ImageDecoder>,
    scope: Arc<TaskScope>,
    stall_timeout: Duration,
    state: Mutex<LoaderState>,
}

struct Slot {
    page: Arc<ReaderPage>,
    descriptor: PageDescriptor,
}

struct InFlight {
    ticket: u64,
    abort: AbortHandle,
}

struct LoaderState {
    // `None` until the page list is known.
    slots: Option<Vec<Slot>>,
    queue: PageQueue,
    in_flight: HashMap<usize, InFlight>,
    limit: usize,
    next_ticket: u64,
    recycled: bool,
}

impl LoaderState {
    fn owns(&self, index: usize, ticket: u64) -> bool {
        !self.recycled
            && self
                .in_flight
                .get(&index)
                .is_some_and(|f| f.ticket == ticket)
    }

    fn page(&self, index: usize) -> Option<Arc<ReaderPage>> {
        self.slots
            .as_ref()
            .and_then(|slots| slots.get(index))
            .map(|slot| Arc::clone(&slot.page))
    }
}

impl PageLoader {
    pub fn new(
        chapter: ChapterInfo,
        source: Arc<dyn ChapterPageSource>,
        decoder: Arc<dyn ImageDecoder>,
        scope: Arc<TaskScope>,
        stall_timeout: Duration,
        limit: usize,
        requested_page: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                chapter,
                source,
                decoder,
                scope,
                stall_timeout,
                state: Mutex::new(LoaderState {
                    slots: None,
                    queue: PageQueue::new(requested_page),
                    in_flight: HashMap::new(),
                    limit: limit.max(1),
                    next_ticket: 0,
                    recycled: false,
                }),
            }),
        }
    }

    pub fn attach(&self, pages: Vec<(Arc<ReaderPage>, PageDescriptor)>) {
        let mut st = self.shared.lock();
        if st.recycled {
            return;
        }
        let len = pages.len();
        st.slots = Some(
            pages
                .into_iter()
                .map(|(page, descriptor)| Slot { page, descriptor })
                .collect(),
        );
        st.queue.retain(|index| index < len);
        if len > 0 && st.queue.anchor() >= len {
            st.queue.set_anchor(len - 1);
        }
        log::debug!(
            "{}: {} pages attached, {} request(s) waiting",
            self.shared.chapter,
            len,
            st.queue.len()
        );
        self.shared.pump(&mut st);
    }

    /// Makes sure page `index` is on its way to `Ready`. Duplicate requests
    /// are coalesced. Returns `false` when the page cannot progress without
    /// an explicit retry, or does not exist.
    pub fn load_page(&self, index: usize) -> bool {
        let mut st = self.shared.lock();
        if st.recycled {
            return false;
        }
        if st.in_flight.contains_key(&index) || st.queue.contains(index) {
            return true;
        }
        if st.slots.is_some() {
            let Some(page) = st.page(index) else {
                return false;
            };
            match page.status() {
                PageStatus::Queued => {}
                PageStatus::Ready => return true,
                PageStatus::Error | PageStatus::Cancelled => return false,
                // Fetching or decoding without an in-flight entry cannot
                // happen while the lock is held.
                PageStatus::Fetching | PageStatus::Decoding => return true,
            }
        }
        st.queue.push(index, Urgency::Normal);
        self.shared.pump(&mut st);
        true
    }

    pub fn set_requested_page(&self, index: usize) {
        let mut st = self.shared.lock();
        let index = match st.slots.as_ref().map(Vec::len) {
            Some(len) if len > 0 => index.min(len - 1),
            _ => index,
        };
        st.queue.set_anchor(index);
    }

    #[cfg(test)]
    pub fn requested_page(&self) -> usize {
        self.shared.lock().queue.anchor()
    }

    pub fn set_concurrency(&self, limit: usize) {
        let mut st = self.shared.lock();
        st.limit = limit.max(1);
        self.shared.pump(&mut st);
    }

    pub fn retry(&self, index: usize) -> bool {
        let mut st = self.shared.lock();
        if st.recycled {
            return false;
        }
        let Some(page) = st.page(index) else {
            return false;
        };
        if !matches!(page.status(), PageStatus::Error | PageStatus::Cancelled) {
            return false;
        }
        if let Some(stale) = st.in_flight.remove(&index) {
            stale.abort.abort();
        }
        page.reset();
        st.queue.push(index, Urgency::Retry);
        log::debug!("{}: retrying page {}", self.shared.chapter, index);
        self.shared.pump(&mut st);
        true
    }

    #[cfg(test)]
    pub fn cancel_page(&self, index: usize) -> bool {
        let mut st = self.shared.lock();
        st.queue.remove(index);
        let stopped = match st.in_flight.remove(&index) {
            Some(flight) => {
                flight.abort.abort();
                true
            }
            None => false,
        };
        let marked = st.page(index).is_some_and(|page| {
            !matches!(page.status(), PageStatus::Ready) && page.mark_cancelled()
        });
        self.shared.pump(&mut st);
        stopped || marked
    }

    /// Stops everything. Pages end up `Cancelled`, or keep their `Error`.
    pub fn recycle(&self) {
        let mut st = self.shared.lock();
        if st.recycled {
            return;
        }
        st.recycled = true;
        st.queue.clear();
        for (_, flight) in st.in_flight.drain() {
            flight.abort.abort();
        }
        if let Some(slots) = &st.slots {
            for slot in slots {
                slot.page.mark_cancelled();
            }
        }
        log::debug!("{}: page loader recycled", self.shared.chapter);
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.shared.lock().in_flight.len()
    }

    #[cfg(test)]
    pub fn queued(&self) -> usize {
        self.shared.lock().queue.len()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LoaderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pump(self: &Arc<Self>, st: &mut LoaderState) {
        if st.recycled || st.slots.is_none() {
            return;
        }
        while st.in_flight.len() < st.limit {
            let Some(index) = st.queue.pop() else {
                break;
            };
            let Some((page, descriptor)) = st.slots.as_ref().and_then(|slots| {
                slots
                    .get(index)
                    .map(|slot| (Arc::clone(&slot.page), slot.descriptor.clone()))
            }) else {
                continue;
            };
            if !page.mark_fetching() {
                continue;
            }

            let ticket = st.next_ticket;
            st.next_ticket += 1;
            let shared = Arc::clone(self);
            let task = async move { shared.run(index, ticket, page, descriptor).await };
            match self.scope.spawn(task) {
                Some(abort) => {
                    log::trace!("{}: fetching page {}", self.chapter, index);
                    st.in_flight.insert(index, InFlight { ticket, abort });
                }
                None => {
                    // Scope already torn down; the chapter is going away.
                    if let Some(page) = st.page(index) {
                        page.mark_cancelled();
                    }
                    break;
                }
            }
        }
    }

    fn with_page<F>(&self, index: usize, ticket: u64, f: F) -> bool
    where
        F: FnOnce() -> bool,
    {
        let st = self.lock();
        st.owns(index, ticket) && f()
    }

    async fn run(
        self: Arc<Self>,
        index: usize,
        ticket: u64,
        page: Arc<ReaderPage>,
        descriptor: PageDescriptor,
    ) {
        // A panicking source or decoder must still release the slot.
        let result = AssertUnwindSafe(self.fetch(index, ticket, &page, &descriptor))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(ReaderError::Network(format!("fetch of page {} crashed", index)))
            });

        let mut st = self.lock();
        if !st.owns(index, ticket) {
            return;
        }
        st.in_flight.remove(&index);
        match result {
            Ok(image) => {
                page.mark_ready(image);
            }
            Err(err) if err.is_cancelled() => {
                page.mark_cancelled();
            }
            Err(err) => {
                log::warn!("{}: page {} failed: {}", self.chapter, index, err);
                page.mark_error(err.to_string());
            }
        }
        self.pump(&mut st);
    }

    async fn fetch(
        &self,
        index: usize,
        ticket: u64,
        page: &ReaderPage,
        descriptor: &PageDescriptor,
    ) -> Result<Arc<DynamicImage>> {
        let stalled = || {
            ReaderError::Network(format!(
                "page {} made no progress for {:?}",
                index, self.stall_timeout
            ))
        };

        let stream = tokio::time::timeout(
            self.stall_timeout,
            self.source.fetch_page_bytes(&self.chapter, descriptor),
        )
        .await
        .map_err(|_| stalled())??;

        let total = stream.content_length.filter(|len| *len > 0);
        let mut chunks = stream.chunks;
        let reserve = total
            .and_then(|n| usize::try_from(n).ok())
            .map_or(0, |n| n.min(MAX_PREALLOC));
        let mut bytes = Vec::with_capacity(reserve);
        while let Some(chunk) = tokio::time::timeout(self.stall_timeout, chunks.next())
            .await
            .map_err(|_| stalled())?
        {
            bytes.extend_from_slice(&chunk?);
            if let Some(total) = total {
                let progress = bytes.len() as f32 / total as f32;
                self.with_page(index, ticket, || page.set_progress(progress));
            }
        }
        drop(chunks);

        if !self.with_page(index, ticket, || page.mark_decoding()) {
            return Err(ReaderError::Cancelled);
        }

        let decoder = Arc::clone(&self.decoder);
        let image = tokio::task::spawn_blocking(move || decoder.decode(&bytes))
            .await
            .map_err(|e| ReaderError::Decode(e.to_string()))??;
        Ok(Arc::new(image))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::source::ImageCrateDecoder;
    use crate::reader::testing::{MockSource, chapter_info, eventually, wait_page};
    use std::sync::Weak;

    fn loader_with(source: &Arc<MockSource>, limit: usize, anchor: usize) -> PageLoader {
        PageLoader::new(
            chapter_info(1),
            source.clone(),
            Arc::new(ImageCrateDecoder),
            TaskScope::new(),
            Duration::from_millis(300),
            limit,
            anchor,
        )
    }

    fn pages(n: usize) -> Vec<(Arc<ReaderPage>, PageDescriptor)> {
        (0..n)
            .map(|i| (Arc::new(ReaderPage::new(i, Weak::new())), PageDescriptor::new(i)))
            .collect()
    }

    fn attach(loader: &PageLoader, n: usize) -> Vec<Arc<ReaderPage>> {
        let pages = pages(n);
        let handles = pages.iter().map(|(p, _)| Arc::clone(p)).collect();
        loader.attach(pages);
        handles
    }

    #[tokio::test]
    async fn loads_a_page_to_ready() {
        let source = MockSource::new(4);
        let loader = loader_with(&source, 2, 0);
        let pages = attach(&loader, 4);

        assert!(loader.load_page(1));
        let state = wait_page(&pages[1], |s| s.status == PageStatus::Ready).await;
        assert!(state.image.is_some());
        assert_eq!(state.progress, 1.0);
        assert!(state.is_consistent());
        assert_eq!(pages[0].status(), PageStatus::Queued);
    }

    #[tokio::test]
    async fn duplicate_requests_fetch_once() {
        let source = MockSource::new(4);
        source.gate_pages();
        let loader = loader_with(&source, 2, 0);
        let pages = attach(&loader, 4);

        assert!(loader.load_page(2));
        assert!(loader.load_page(2));
        eventually(|| source.started_pages(1).len() == 1).await;
        assert!(loader.load_page(2));

        source.release_pages(10);
        wait_page(&pages[2], |s| s.status == PageStatus::Ready).await;
        assert!(loader.load_page(2));
        assert_eq!(source.started_pages(1), vec![2]);
    }

    #[tokio::test]
    async fn start_order_follows_distance_then_insertion() {
        let source = MockSource::new(60);
        source.gate_pages();
        let loader = loader_with(&source, 1, 10);
        let pages = attach(&loader, 60);

        // Occupy the only slot so the rest queue up.
        loader.load_page(10);
        eventually(|| source.started_pages(1).len() == 1).await;
        for i in [2, 11, 9, 50] {
            loader.load_page(i);
        }
        source.release_pages(100);
        wait_page(&pages[50], |s| s.status == PageStatus::Ready).await;

        assert_eq!(source.started_pages(1), vec![10, 11, 9, 2, 50]);
    }

    #[tokio::test]
    async fn moving_anchor_does_not_restart_in_flight_fetch() {
        let source = MockSource::new(60);
        source.gate_pages();
        let loader = loader_with(&source, 1, 5);
        let pages = attach(&loader, 60);

        loader.load_page(5);
        wait_page(&pages[5], |s| s.status == PageStatus::Fetching).await;
        loader.load_page(6);
        loader.load_page(49);
        loader.set_requested_page(50);
        assert_eq!(loader.in_flight(), 1);
        assert_eq!(loader.queued(), 2);

        source.release_pages(100);
        wait_page(&pages[5], |s| s.status == PageStatus::Ready).await;
        wait_page(&pages[6], |s| s.status == PageStatus::Ready).await;

        // Page 5 ran exactly once; 49 overtook 6 after the anchor moved.
        assert_eq!(source.started_pages(1), vec![5, 49, 6]);
    }

    #[tokio::test]
    async fn never_exceeds_concurrency_limit() {
        let source = MockSource::new(5);
        source.gate_pages();
        let loader = loader_with(&source, 2, 0);
        let pages = attach(&loader, 5);

        for i in 0..5 {
            loader.load_page(i);
        }

        let busy = |pages: &[Arc<ReaderPage>]| {
            pages
                .iter()
                .filter(|p| matches!(p.status(), PageStatus::Fetching | PageStatus::Decoding))
                .count()
        };

        for released in 0..5 {
            eventually(|| source.started_pages(1).len() == (released + 2).min(5)).await;
            assert!(busy(&pages) <= 2);
            assert!(loader.in_flight() <= 2);
            source.release_pages(1);
        }
        for page in &pages {
            wait_page(page, |s| s.status == PageStatus::Ready).await;
        }
        assert!(source.max_active() <= 2);
        assert_eq!(source.started_pages(1).len(), 5);
    }

    #[tokio::test]
    async fn network_failure_marks_error_and_retry_recovers() {
        let source = MockSource::new(3);
        source.fail_page(1);
        let loader = loader_with(&source, 2, 0);
        let pages = attach(&loader, 3);

        loader.load_page(1);
        let state = wait_page(&pages[1], |s| s.status == PageStatus::Error).await;
        assert!(state.error.is_some());
        assert!(state.is_consistent());
        // No automatic retry.
        assert!(!loader.load_page(1));

        source.heal_page(1);
        assert!(loader.retry(1));
        let state = wait_page(&pages[1], |s| s.status == PageStatus::Ready).await;
        assert!(state.error.is_none());
        assert_eq!(source.started_pages(1), vec![1, 1]);
    }

    #[tokio::test]
    async fn retry_only_applies_to_failed_pages() {
        let source = MockSource::new(2);
        let loader = loader_with(&source, 2, 0);
        let pages = attach(&loader, 2);

        assert!(!loader.retry(0));
        loader.load_page(0);
        wait_page(&pages[0], |s| s.status == PageStatus::Ready).await;
        assert!(!loader.retry(0));
        assert_eq!(pages[0].status(), PageStatus::Ready);
        assert!(!loader.retry(9));
    }

    #[tokio::test]
    async fn retry_goes_ahead_of_nearer_pages() {
        let source = MockSource::new(40);
        source.fail_page(30);
        let loader = loader_with(&source, 1, 0);
        let pages = attach(&loader, 40);

        loader.load_page(30);
        wait_page(&pages[30], |s| s.status == PageStatus::Error).await;
        source.heal_page(30);
        source.gate_pages();

        loader.load_page(0);
        eventually(|| source.started_pages(1).len() == 2).await;
        loader.load_page(1);
        loader.load_page(2);
        loader.retry(30);
        source.release_pages(100);
        wait_page(&pages[2], |s| s.status == PageStatus::Ready).await;

        assert_eq!(source.started_pages(1), vec![30, 0, 30, 1, 2]);
    }

    #[tokio::test]
    async fn corrupt_bytes_are_a_page_error() {
        let source = MockSource::new(2);
        source.corrupt_page(0);
        let loader = loader_with(&source, 2, 0);
        let pages = attach(&loader, 2);

        loader.load_page(0);
        let state = wait_page(&pages[0], |s| s.status == PageStatus::Error).await;
        assert!(state.error.unwrap_or_default().contains("decode"));
    }

    #[tokio::test]
    async fn stalled_fetch_times_out_into_error() {
        let source = MockSource::new(2);
        source.stall_page(0);
        let loader = loader_with(&source, 2, 0);
        let pages = attach(&loader, 2);

        loader.load_page(0);
        let state = wait_page(&pages[0], |s| s.status == PageStatus::Error).await;
        assert!(state.error.unwrap_or_default().contains("no progress"));
    }

    #[tokio::test]
    async fn absurd_content_length_is_not_preallocated() {
        let source = MockSource::new(2);
        source.claim_length(0, u64::MAX);
        let loader = loader_with(&source, 1, 0);
        let pages = attach(&loader, 2);

        loader.load_page(0);
        loader.load_page(1);
        wait_page(&pages[0], |s| s.status == PageStatus::Ready).await;
        wait_page(&pages[1], |s| s.status == PageStatus::Ready).await;
        assert_eq!(loader.in_flight(), 0);
    }

    #[tokio::test]
    async fn panicking_fetch_fails_the_page_and_frees_its_slot() {
        let source = MockSource::new(2);
        source.panic_on_page(0);
        let loader = loader_with(&source, 1, 0);
        let pages = attach(&loader, 2);

        loader.load_page(0);
        loader.load_page(1);
        let state = wait_page(&pages[0], |s| s.status == PageStatus::Error).await;
        assert!(state.error.unwrap_or_default().contains("crashed"));

        // The only slot is handed on to the next request.
        wait_page(&pages[1], |s| s.status == PageStatus::Ready).await;
        assert_eq!(loader.in_flight(), 0);
        assert_eq!(source.started_pages(1), vec![0, 1]);
    }

    #[tokio::test]
    async fn cancelling_one_page_spares_siblings_and_allows_retry() {
        let source = MockSource::new(3);
        source.gate_pages();
        let loader = loader_with(&source, 2, 0);
        let pages = attach(&loader, 3);

        loader.load_page(0);
        loader.load_page(1);
        wait_page(&pages[0], |s| s.status == PageStatus::Fetching).await;
        wait_page(&pages[1], |s| s.status == PageStatus::Fetching).await;

        assert!(loader.cancel_page(0));
        let state = pages[0].state();
        assert_eq!(state.status, PageStatus::Cancelled);
        assert!(state.error.is_none());

        source.release_pages(100);
        wait_page(&pages[1], |s| s.status == PageStatus::Ready).await;

        assert!(loader.retry(0));
        wait_page(&pages[0], |s| s.status == PageStatus::Ready).await;
    }

    #[tokio::test]
    async fn requests_before_attach_are_served_after() {
        let source = MockSource::new(3);
        let loader = loader_with(&source, 2, 0);

        assert!(loader.load_page(1));
        assert!(loader.load_page(7));
        assert_eq!(loader.queued(), 2);

        let pages = attach(&loader, 3);
        wait_page(&pages[1], |s| s.status == PageStatus::Ready).await;
        assert_eq!(source.started_pages(1), vec![1]);
        assert!(!loader.load_page(7));
    }

    #[tokio::test]
    async fn recycle_leaves_pages_terminal() {
        let source = MockSource::new(4);
        source.gate_pages();
        source.fail_page(3);
        let loader = loader_with(&source, 4, 0);
        let pages = attach(&loader, 4);

        for i in 0..4 {
            loader.load_page(i);
        }
        wait_page(&pages[3], |s| s.status == PageStatus::Error).await;
        wait_page(&pages[0], |s| s.status == PageStatus::Fetching).await;

        loader.recycle();
        loader.recycle();
        source.release_pages(100);
        tokio::time::sleep(Duration::from_millis(50)).await;

        for page in &pages[..3] {
            let state = page.state();
            assert_eq!(state.status, PageStatus::Cancelled);
            assert!(state.error.is_none());
            assert!(state.is_consistent());
        }
        assert_eq!(pages[3].status(), PageStatus::Error);
        assert_eq!(loader.in_flight(), 0);
        assert!(!loader.load_page(0));
        assert!(!loader.retry(0));
    }
}

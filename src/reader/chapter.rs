use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

use super::ReaderOptions;
use super::error::{ReaderError, Result};
use super::loader::PageLoader;
use super::observable::StateSlot;
use super::page::ReaderPage;
use super::scope::TaskScope;
use crate::backend::source::{ChapterInfo, ChapterPageSource, ImageDecoder, PageDescriptor};

pub type Pages = Arc<[Arc<ReaderPage>]>;

#[derive(Clone, Default)]
pub enum ChapterState {
    #[default]
    Wait,
    Loading,
    Error(ReaderError),
    Loaded(Pages),
}

impl ChapterState {
    pub fn pages(&self) -> Option<&Pages> {
        match self {
            ChapterState::Loaded(pages) => Some(pages),
            _ => None,
        }
    }

    pub fn is_wait(&self) -> bool {
        matches!(self, ChapterState::Wait)
    }

    #[cfg(test)]
    pub fn is_loading(&self) -> bool {
        matches!(self, ChapterState::Loading)
    }

    #[cfg(test)]
    pub fn is_loaded(&self) -> bool {
        matches!(self, ChapterState::Loaded(_))
    }

    pub fn error(&self) -> Option<&ReaderError> {
        match self {
            ChapterState::Error(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Debug for ChapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChapterState::Wait => f.write_str("Wait"),
            ChapterState::Loading => f.write_str("Loading"),
            ChapterState::Error(err) => f.debug_tuple("Error").field(err).finish(),
            ChapterState::Loaded(pages) => write!(f, "Loaded({} pages)", pages.len()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChapterPriority {
    Current,
    #[default]
    Prefetch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreloadDirection {
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy)]
struct Preload {
    count: usize,
    direction: PreloadDirection,
}

struct ChapterInner {
    /// Bumped on every load and recycle; results from older generations
    /// are dropped.
    generation: u64,
    scope: Arc<TaskScope>,
    loader: Option<PageLoader>,
    requested_page: usize,
    priority: ChapterPriority,
    preload: Option<Preload>,
}

pub struct ReaderChapter {
    info: ChapterInfo,
    source: Arc<dyn ChapterPageSource>,
    decoder: Arc<dyn ImageDecoder>,
    options: ReaderOptions,
    state: StateSlot<ChapterState>,
    inner: Mutex<ChapterInner>,
}

impl ReaderChapter {
    pub fn new(
        info: ChapterInfo,
        source: Arc<dyn ChapterPageSource>,
        decoder: Arc<dyn ImageDecoder>,
        options: ReaderOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            info,
            source,
            decoder,
            options,
            state: StateSlot::default(),
            inner: Mutex::new(ChapterInner {
                generation: 0,
                scope: TaskScope::new(),
                loader: None,
                requested_page: 0,
                priority: ChapterPriority::default(),
                preload: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ChapterInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn info(&self) -> &ChapterInfo {
        &self.info
    }

    pub fn state(&self) -> ChapterState {
        self.state.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChapterState> {
        self.state.subscribe()
    }

    #[cfg(test)]
    pub fn pages(&self) -> Option<Pages> {
        self.state.borrow().pages().cloned()
    }

    pub fn page(&self, index: usize) -> Option<Arc<ReaderPage>> {
        self.state
            .borrow()
            .pages()
            .and_then(|pages| pages.get(index).cloned())
    }

    pub fn page_count(&self) -> Option<usize> {
        self.state.borrow().pages().map(|pages| pages.len())
    }

    pub fn load(self: &Arc<Self>) -> bool {
        let mut inner = self.lock();
        if !self.state.borrow().is_wait() {
            return false;
        }
        self.start_loading(&mut inner);
        true
    }

    pub fn retry(self: &Arc<Self>) -> bool {
        let mut inner = self.lock();
        let retryable = self
            .state
            .borrow()
            .error()
            .is_some_and(ReaderError::is_retryable);
        if !retryable {
            return false;
        }
        log::info!("{}: retrying chapter load", self.info);
        self.start_loading(&mut inner);
        true
    }

    pub fn recycle(&self) {
        let mut inner = self.lock();
        if self.state.borrow().is_wait() && inner.loader.is_none() {
            return;
        }
        inner.generation += 1;
        inner.preload = None;
        self.state.set(ChapterState::Wait);
        if let Some(loader) = inner.loader.take() {
            loader.recycle();
        }
        inner.scope.cancel();
        inner.scope = TaskScope::new();
        log::debug!("{}: recycled", self.info);
    }

    #[cfg(test)]
    pub fn priority(&self) -> ChapterPriority {
        self.lock().priority
    }

    pub fn set_priority(&self, priority: ChapterPriority) {
        let mut inner = self.lock();
        if inner.priority == priority {
            return;
        }
        inner.priority = priority;
        let limit = self.limit_for(priority);
        if let Some(loader) = &inner.loader {
            loader.set_concurrency(limit);
        }
    }

    /// The page the reader last asked for, clamped to the chapter once the
    /// page count is known.
    pub fn requested_page(&self) -> usize {
        let requested = self.lock().requested_page;
        match self.page_count() {
            Some(0) => 0,
            Some(len) => requested.min(len - 1),
            None => requested,
        }
    }

    pub fn set_requested_page(&self, index: usize) {
        let mut inner = self.lock();
        inner.requested_page = index;
        if let Some(loader) = &inner.loader {
            loader.set_requested_page(index);
        }
    }

    #[cfg(test)]
    pub fn load_page(&self, index: usize) -> bool {
        self.lock()
            .loader
            .as_ref()
            .is_some_and(|loader| loader.load_page(index))
    }

    pub fn retry_page(&self, index: usize) -> bool {
        self.lock()
            .loader
            .as_ref()
            .is_some_and(|loader| loader.retry(index))
    }

    pub fn preload(&self, count: usize, direction: PreloadDirection) {
        let mut inner = self.lock();
        let plan = Preload { count, direction };
        match self.page_count() {
            Some(len) => {
                if let Some(loader) = &inner.loader {
                    issue_preload(loader, inner.requested_page, len, plan);
                }
            }
            None => inner.preload = Some(plan),
        }
    }

    fn limit_for(&self, priority: ChapterPriority) -> usize {
        match priority {
            ChapterPriority::Current => self.options.max_concurrent_fetches,
            ChapterPriority::Prefetch => self.options.prefetch_concurrency,
        }
    }

    fn start_loading(self: &Arc<Self>, inner: &mut ChapterInner) {
        inner.generation += 1;
        let generation = inner.generation;
        if inner.scope.is_cancelled() {
            inner.scope = TaskScope::new();
        }

        inner.loader = Some(PageLoader::new(
            self.info.clone(),
            Arc::clone(&self.source),
            Arc::clone(&self.decoder),
            Arc::clone(&inner.scope),
            self.options.stall_timeout,
            self.limit_for(inner.priority),
            inner.requested_page,
        ));
        self.state.set(ChapterState::Loading);
        log::debug!("{}: loading page list", self.info);

        let chapter = Arc::downgrade(self);
        let source = Arc::clone(&self.source);
        let info = self.info.clone();
        let spawned = inner.scope.spawn(async move {
            let result = source.fetch_page_list(&info).await;
            if let Some(chapter) = chapter.upgrade() {
                chapter.finish_loading(generation, result);
            }
        });
        if spawned.is_none() {
            log::warn!("{}: scope closed before the page list was requested", self.info);
        }
    }

    fn finish_loading(self: &Arc<Self>, generation: u64, result: Result<Vec<PageDescriptor>>) {
        let mut inner = self.lock();
        if inner.generation != generation {
            log::debug!("{}: dropping stale page list", self.info);
            return;
        }

        let descriptors = match result {
            Ok(descriptors) => descriptors,
            Err(err) if err.is_cancelled() => return,
            Err(err) => {
                log::warn!("{}: failed to load: {}", self.info, err);
                if let Some(loader) = inner.loader.take() {
                    loader.recycle();
                }
                self.state.set(ChapterState::Error(err));
                return;
            }
        };

        if let Some(expected) = self.info.page_count {
            if expected != descriptors.len() {
                log::warn!(
                    "{}: server reports {} pages, metadata said {}",
                    self.info,
                    descriptors.len(),
                    expected
                );
            }
        }

        let owner = Arc::downgrade(self);
        let slots: Vec<(Arc<ReaderPage>, PageDescriptor)> = descriptors
            .into_iter()
            .enumerate()
            .map(|(index, mut descriptor)| {
                descriptor.index = index;
                (Arc::new(ReaderPage::new(index, owner.clone())), descriptor)
            })
            .collect();
        let pages: Pages = slots.iter().map(|(page, _)| Arc::clone(page)).collect();
        let len = pages.len();

        if len > 0 {
            inner.requested_page = inner.requested_page.min(len - 1);
        }
        let requested = inner.requested_page;
        let preload = inner.preload.take();

        if let Some(loader) = &inner.loader {
            loader.set_requested_page(requested);
            loader.attach(slots);
            if len > 0 {
                loader.load_page(requested);
            }
            if let Some(plan) = preload {
                issue_preload(loader, requested, len, plan);
            }
        }
        log::info!("{}: loaded {} pages", self.info, len);
        self.state.set(ChapterState::Loaded(pages));
    }
}

fn issue_preload(loader: &PageLoader, anchor: usize, len: usize, plan: Preload) {
    if len == 0 {
        return;
    }
    let anchor = anchor.min(len - 1);
    for step in 0..plan.count {
        let index = match plan.direction {
            PreloadDirection::Forward => anchor.checked_add(step),
            PreloadDirection::Backward => anchor.checked_sub(step),
        };
        match index {
            Some(index) if index < len => {
                loader.load_page(index);
            }
            _ => break,
        }
    }
}

impl fmt::Debug for ReaderChapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderChapter")
            .field("info", &self.info)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl Drop for ReaderChapter {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(loader) = inner.loader.take() {
            loader.recycle();
        }
        inner.scope.cancel();
    }
}

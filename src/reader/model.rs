use std::sync::Arc;

use super::chapter::{ChapterPriority, PreloadDirection, ReaderChapter};
use super::viewer::{Slot, ViewerChapters};
use super::{LAST_PAGE, ReaderOptions};
use crate::backend::source::{ChapterInfo, ChapterPageSource, ImageDecoder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderPosition {
    pub chapter: usize,
    pub page: usize,
}

pub struct ReaderModel {
    source: Arc<dyn ChapterPageSource>,
    decoder: Arc<dyn ImageDecoder>,
    options: ReaderOptions,
    chapters: Vec<ChapterInfo>,
    viewer: ViewerChapters,
    current: Option<usize>,
}

impl ReaderModel {
    pub fn new(
        source: Arc<dyn ChapterPageSource>,
        decoder: Arc<dyn ImageDecoder>,
        options: ReaderOptions,
        chapters: Vec<ChapterInfo>,
    ) -> Self {
        Self {
            source,
            decoder,
            options,
            chapters,
            viewer: ViewerChapters::new(),
            current: None,
        }
    }

    pub fn viewer(&self) -> &ViewerChapters {
        &self.viewer
    }

    pub fn current_chapter(&self) -> Option<Arc<ReaderChapter>> {
        self.viewer.current()
    }

    pub fn position(&self) -> Option<ReaderPosition> {
        let chapter = self.current?;
        let page = self.viewer.current()?.requested_page();
        Some(ReaderPosition { chapter, page })
    }

    /// Jumps to `page` of the chapter at `chapter` in the list. Neighbours
    /// of the current chapter are reached by shifting the window; anything
    /// further away rebuilds it from scratch.
    pub fn open(&mut self, chapter: usize, page: usize) -> bool {
        if chapter >= self.chapters.len() {
            return false;
        }
        match self.current {
            Some(current) if current == chapter => self.advance_to_page(page),
            Some(current) if chapter == current + 1 => self.shift_forward(page),
            Some(current) if chapter + 1 == current => self.shift_backward(page),
            _ => {
                log::info!("opening {} at page {}", self.chapters[chapter], page);
                self.viewer.recycle();
                let target = self.make_chapter(chapter);
                self.viewer.set(Slot::Current, Some(target));
                self.current = Some(chapter);
                self.enter_current(page, PreloadDirection::Forward);
                self.prefetch_neighbours();
                true
            }
        }
    }

    pub fn advance_to_page(&mut self, index: usize) -> bool {
        let Some(chapter) = self.viewer.current() else {
            return false;
        };
        if let Some(count) = chapter.page_count() {
            if index >= count {
                return self.shift_forward(0);
            }
        }
        chapter.set_requested_page(index);
        chapter.preload(self.options.preload_pages + 1, PreloadDirection::Forward);
        true
    }

    pub fn next_page(&mut self) -> bool {
        match self.settled_page() {
            Some(page) => self.advance_to_page(page + 1),
            None => false,
        }
    }

    pub fn previous_page(&mut self) -> bool {
        match self.settled_page() {
            Some(0) => self.shift_backward(LAST_PAGE),
            Some(page) => {
                let Some(chapter) = self.viewer.current() else {
                    return false;
                };
                chapter.set_requested_page(page - 1);
                chapter.preload(self.options.preload_pages + 1, PreloadDirection::Backward);
                true
            }
            None => false,
        }
    }

    pub fn next_chapter(&mut self) -> bool {
        self.shift_forward(0)
    }

    pub fn previous_chapter(&mut self) -> bool {
        self.shift_backward(0)
    }

    pub fn retry_page(&self, index: usize) -> bool {
        self.viewer
            .current()
            .is_some_and(|chapter| chapter.retry_page(index))
    }

    pub fn retry_chapter(&self) -> bool {
        self.viewer.current().is_some_and(|chapter| chapter.retry())
    }

    pub fn close(&mut self) {
        if self.current.take().is_some() {
            log::info!("closing reader");
        }
        self.viewer.recycle();
    }

    fn settled_page(&self) -> Option<usize> {
        let chapter = self.viewer.current()?;
        match chapter.page_count() {
            Some(0) => Some(0),
            Some(_) => Some(chapter.requested_page()),
            None => {
                let page = chapter.requested_page();
                (page != LAST_PAGE).then_some(page)
            }
        }
    }

    fn shift_forward(&mut self, page: usize) -> bool {
        let Some(current) = self.current else {
            return false;
        };
        let target = current + 1;
        if target >= self.chapters.len() {
            log::debug!("already at the last chapter");
            return false;
        }
        if self.viewer.next().is_none() {
            self.viewer.set(Slot::Next, Some(self.make_chapter(target)));
        }
        self.viewer.shift_forward(None);
        self.current = Some(target);
        log::info!("moved to {}", self.chapters[target]);
        self.enter_current(page, PreloadDirection::Forward);
        self.prefetch_neighbours();
        true
    }

    fn shift_backward(&mut self, page: usize) -> bool {
        let Some(current) = self.current else {
            return false;
        };
        let Some(target) = current.checked_sub(1) else {
            log::debug!("already at the first chapter");
            return false;
        };
        if self.viewer.previous().is_none() {
            self.viewer
                .set(Slot::Previous, Some(self.make_chapter(target)));
        }
        self.viewer.shift_backward(None);
        self.current = Some(target);
        log::info!("moved to {}", self.chapters[target]);
        let direction = if page == LAST_PAGE {
            PreloadDirection::Backward
        } else {
            PreloadDirection::Forward
        };
        self.enter_current(page, direction);
        self.prefetch_neighbours();
        true
    }

    fn enter_current(&self, page: usize, direction: PreloadDirection) {
        let Some(chapter) = self.viewer.current() else {
            return;
        };
        chapter.set_priority(ChapterPriority::Current);
        chapter.set_requested_page(page);
        if chapter.state().is_wait() {
            chapter.load();
        }
        chapter.preload(self.options.preload_pages + 1, direction);
    }

    fn prefetch_neighbours(&self) {
        let Some(current) = self.current else {
            return;
        };

        if let Some(next) = self.chapters.get(current + 1) {
            let chapter = match self.viewer.next() {
                Some(chapter) => chapter,
                None => {
                    log::debug!("prefetching {}", next);
                    let chapter = self.make_chapter(current + 1);
                    self.viewer.set(Slot::Next, Some(Arc::clone(&chapter)));
                    chapter
                }
            };
            chapter.set_priority(ChapterPriority::Prefetch);
            if chapter.state().is_wait() {
                chapter.set_requested_page(0);
                chapter.load();
            }
            chapter.preload(self.options.prefetch_pages, PreloadDirection::Forward);
        }

        if let Some(previous) = current.checked_sub(1) {
            let chapter = match self.viewer.previous() {
                Some(chapter) => chapter,
                None => {
                    log::debug!("prefetching {}", self.chapters[previous]);
                    let chapter = self.make_chapter(previous);
                    self.viewer.set(Slot::Previous, Some(Arc::clone(&chapter)));
                    chapter
                }
            };
            chapter.set_priority(ChapterPriority::Prefetch);
            if chapter.state().is_wait() {
                chapter.set_requested_page(LAST_PAGE);
                chapter.load();
                chapter.preload(self.options.prefetch_pages, PreloadDirection::Backward);
            }
        }
    }

    fn make_chapter(&self, position: usize) -> Arc<ReaderChapter> {
        ReaderChapter::new(
            self.chapters[position].clone(),
            Arc::clone(&self.source),
            Arc::clone(&self.decoder),
            self.options.clone(),
        )
    }
}

impl Drop for ReaderModel {
    fn drop(&mut self) {
        self.close();
    }
}

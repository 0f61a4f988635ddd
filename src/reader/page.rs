use image::DynamicImage;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::watch;

use super::chapter::ReaderChapter;
use super::observable::StateSlot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageStatus {
    #[default]
    Queued,
    Fetching,
    Decoding,
    Ready,
    Error,
    Cancelled,
}

#[derive(Clone, Default)]
pub struct PageState {
    pub status: PageStatus,
    pub progress: f32,
    pub image: Option<Arc<DynamicImage>>,
    pub error: Option<String>,
}

impl PageState {
    pub fn is_consistent(&self) -> bool {
        self.image.is_some() == (self.status == PageStatus::Ready)
            && (self.error.is_some() == (self.status == PageStatus::Error))
    }
}

impl fmt::Debug for PageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageState")
            .field("status", &self.status)
            .field("progress", &self.progress)
            .field("image", &self.image.as_ref().map(|i| (i.width(), i.height())))
            .field("error", &self.error)
            .finish()
    }
}

pub struct ReaderPage {
    index: usize,
    chapter: Weak<ReaderChapter>,
    state: StateSlot<PageState>,
}

impl ReaderPage {
    pub fn new(index: usize, chapter: Weak<ReaderChapter>) -> Self {
        Self {
            index,
            chapter,
            state: StateSlot::default(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn chapter(&self) -> Option<Arc<ReaderChapter>> {
        self.chapter.upgrade()
    }

    pub fn state(&self) -> PageState {
        self.state.get()
    }

    pub fn status(&self) -> PageStatus {
        self.state.borrow().status
    }

    pub fn subscribe(&self) -> watch::Receiver<PageState> {
        self.state.subscribe()
    }

    pub fn reset(&self) {
        self.state.update(|s| {
            let changed = s.status != PageStatus::Queued || s.progress != 0.0;
            *s = PageState::default();
            changed
        });
    }

    pub fn mark_fetching(&self) -> bool {
        self.transition(&[PageStatus::Queued], |s| {
            s.status = PageStatus::Fetching;
            s.progress = 0.0;
        })
    }

    pub fn set_progress(&self, progress: f32) -> bool {
        let progress = progress.clamp(0.0, 1.0);
        self.state.update(|s| {
            if s.status != PageStatus::Fetching || progress <= s.progress {
                return false;
            }
            s.progress = progress;
            true
        })
    }

    pub fn mark_decoding(&self) -> bool {
        self.transition(&[PageStatus::Fetching], |s| {
            s.status = PageStatus::Decoding;
            s.progress = 1.0;
        })
    }

    pub fn mark_ready(&self, image: Arc<DynamicImage>) -> bool {
        self.transition(&[PageStatus::Decoding], |s| {
            s.status = PageStatus::Ready;
            s.progress = 1.0;
            s.image = Some(image);
        })
    }

    pub fn mark_error(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        self.transition(
            &[
                PageStatus::Queued,
                PageStatus::Fetching,
                PageStatus::Decoding,
                PageStatus::Error,
                PageStatus::Cancelled,
            ],
            |s| {
                s.status = PageStatus::Error;
                s.image = None;
                s.error = Some(message);
            },
        )
    }

    pub fn mark_cancelled(&self) -> bool {
        self.transition(
            &[
                PageStatus::Queued,
                PageStatus::Fetching,
                PageStatus::Decoding,
                PageStatus::Ready,
            ],
            |s| {
                s.status = PageStatus::Cancelled;
                s.progress = 0.0;
                s.image = None;
                s.error = None;
            },
        )
    }

    fn transition<F>(&self, from: &[PageStatus], apply: F) -> bool
    where
        F: FnOnce(&mut PageState),
    {
        let applied = self.state.update(|s| {
            if !from.contains(&s.status) {
                return false;
            }
            apply(s);
            debug_assert!(s.is_consistent(), "page {}: {:?}", self.index, s);
            true
        });
        if !applied {
            log::trace!(
                "page {}: rejected transition from {:?}",
                self.index,
                self.status()
            );
        }
        applied
    }
}

impl fmt::Debug for ReaderPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderPage")
            .field("index", &self.index)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

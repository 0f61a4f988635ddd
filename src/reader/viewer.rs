use std::sync::Arc;
use tokio::sync::watch;

use super::chapter::ReaderChapter;
use super::observable::StateSlot;

pub type ChapterSlot = Option<Arc<ReaderChapter>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Previous,
    Current,
    Next,
}

#[derive(Debug, Default)]
pub struct ViewerChapters {
    previous: StateSlot<ChapterSlot>,
    current: StateSlot<ChapterSlot>,
    next: StateSlot<ChapterSlot>,
}

impl ViewerChapters {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, which: Slot) -> &StateSlot<ChapterSlot> {
        match which {
            Slot::Previous => &self.previous,
            Slot::Current => &self.current,
            Slot::Next => &self.next,
        }
    }

    pub fn get(&self, which: Slot) -> ChapterSlot {
        self.slot(which).get()
    }

    pub fn previous(&self) -> ChapterSlot {
        self.get(Slot::Previous)
    }

    pub fn current(&self) -> ChapterSlot {
        self.get(Slot::Current)
    }

    pub fn next(&self) -> ChapterSlot {
        self.get(Slot::Next)
    }

    pub fn subscribe(&self, which: Slot) -> watch::Receiver<ChapterSlot> {
        self.slot(which).subscribe()
    }

    pub fn position_of(&self, chapter: &Arc<ReaderChapter>) -> Option<Slot> {
        [Slot::Previous, Slot::Current, Slot::Next]
            .into_iter()
            .find(|which| {
                self.slot(*which)
                    .borrow()
                    .as_ref()
                    .is_some_and(|c| Arc::ptr_eq(c, chapter))
            })
    }

    /// Puts `chapter` in `which` and returns whatever was there, without
    /// recycling it. A chapter already sitting in another slot is moved out
    /// of it first, so one instance never occupies two slots.
    pub fn set(&self, which: Slot, chapter: ChapterSlot) -> ChapterSlot {
        if let Some(chapter) = &chapter {
            if let Some(other) = self.position_of(chapter) {
                if other != which {
                    log::warn!("{} moved from {:?} to {:?}", chapter.info(), other, which);
                    self.slot(other).set(None);
                }
            }
        }
        self.slot(which).replace(chapter)
    }

    /// current -> previous, next -> current, `incoming` -> next. The old
    /// previous chapter is recycled and returned.
    pub fn shift_forward(&self, incoming: ChapterSlot) -> ChapterSlot {
        let dropped = self.slot(Slot::Previous).replace(None);
        let current = self.slot(Slot::Current).replace(None);
        let next = self.slot(Slot::Next).replace(None);
        self.set(Slot::Previous, current);
        self.set(Slot::Current, next);
        self.set(Slot::Next, incoming);
        self.retire(dropped)
    }

    /// current -> next, previous -> current, `incoming` -> previous. The old
    /// next chapter is recycled and returned.
    pub fn shift_backward(&self, incoming: ChapterSlot) -> ChapterSlot {
        let dropped = self.slot(Slot::Next).replace(None);
        let current = self.slot(Slot::Current).replace(None);
        let previous = self.slot(Slot::Previous).replace(None);
        self.set(Slot::Next, current);
        self.set(Slot::Current, previous);
        self.set(Slot::Previous, incoming);
        self.retire(dropped)
    }

    pub fn recycle(&self) {
        for which in [Slot::Previous, Slot::Current, Slot::Next] {
            if let Some(chapter) = self.slot(which).replace(None) {
                chapter.recycle();
            }
        }
    }

    fn retire(&self, dropped: ChapterSlot) -> ChapterSlot {
        let chapter = dropped?;
        // A chapter handed back in as `incoming` stays alive.
        if self.position_of(&chapter).is_none() {
            log::debug!("{} left the window", chapter.info());
            chapter.recycle();
        }
        Some(chapter)
    }
}

//! Scripted in-memory page source for the reader tests.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use image::DynamicImage;
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Semaphore, watch};

use super::ReaderOptions;
use super::chapter::{ChapterState, ReaderChapter};
use super::error::{ReaderError, Result};
use super::page::{PageState, ReaderPage};
use crate::backend::source::{ChapterInfo, ChapterPageSource, PageByteStream, PageDescriptor};

const WAIT: Duration = Duration::from_secs(5);

pub fn chapter_info(id: i64) -> ChapterInfo {
    ChapterInfo {
        id,
        manga_id: 7,
        index: id,
        name: format!("Chapter {}", id),
        page_count: None,
    }
}

pub fn test_options() -> ReaderOptions {
    ReaderOptions {
        max_concurrent_fetches: 2,
        prefetch_concurrency: 1,
        stall_timeout: Duration::from_millis(300),
        preload_pages: 1,
        prefetch_pages: 1,
    }
}

fn png_bytes() -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    // Encoding a tiny in-memory image cannot fail.
    let _ = DynamicImage::new_rgb8(3, 4).write_to(&mut out, image::ImageFormat::Png);
    out.into_inner()
}

#[derive(Default)]
struct Script {
    default_pages: usize,
    page_counts: HashMap<i64, usize>,
    list_errors: HashMap<i64, ReaderError>,
    failing_pages: HashSet<usize>,
    corrupt_pages: HashSet<usize>,
    stalled_pages: HashSet<usize>,
    panicking_pages: HashSet<usize>,
    claimed_lengths: HashMap<usize, u64>,
    gate_pages: bool,
    gate_lists: bool,
    started: Vec<(i64, usize)>,
    lists: Vec<i64>,
}

pub struct MockSource {
    script: Mutex<Script>,
    page_gate: Semaphore,
    list_gate: Semaphore,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    image: Vec<u8>,
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockSource {
    pub fn new(default_pages: usize) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(Script {
                default_pages,
                ..Script::default()
            }),
            page_gate: Semaphore::new(0),
            list_gate: Semaphore::new(0),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
            image: png_bytes(),
        })
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_pages(&self, chapter: i64, count: usize) {
        self.script().page_counts.insert(chapter, count);
    }

    pub fn fail_list(&self, chapter: i64, err: ReaderError) {
        self.script().list_errors.insert(chapter, err);
    }

    pub fn heal_list(&self, chapter: i64) {
        self.script().list_errors.remove(&chapter);
    }

    pub fn fail_page(&self, index: usize) {
        self.script().failing_pages.insert(index);
    }

    pub fn heal_page(&self, index: usize) {
        self.script().failing_pages.remove(&index);
    }

    pub fn corrupt_page(&self, index: usize) {
        self.script().corrupt_pages.insert(index);
    }

    pub fn stall_page(&self, index: usize) {
        self.script().stalled_pages.insert(index);
    }

    pub fn panic_on_page(&self, index: usize) {
        self.script().panicking_pages.insert(index);
    }

    pub fn claim_length(&self, index: usize, len: u64) {
        self.script().claimed_lengths.insert(index, len);
    }

    pub fn gate_pages(&self) {
        self.script().gate_pages = true;
    }

    pub fn release_pages(&self, n: usize) {
        self.page_gate.add_permits(n);
    }

    pub fn gate_lists(&self) {
        self.script().gate_lists = true;
    }

    pub fn release_lists(&self, n: usize) {
        self.list_gate.add_permits(n);
    }

    pub fn started(&self) -> Vec<(i64, usize)> {
        self.script().started.clone()
    }

    pub fn started_pages(&self, chapter: i64) -> Vec<usize> {
        self.script()
            .started
            .iter()
            .filter(|(c, _)| *c == chapter)
            .map(|(_, p)| *p)
            .collect()
    }

    pub fn list_calls(&self, chapter: i64) -> usize {
        self.script().lists.iter().filter(|c| **c == chapter).count()
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChapterPageSource for MockSource {
    async fn fetch_page_list(&self, chapter: &ChapterInfo) -> Result<Vec<PageDescriptor>> {
        let gated = {
            let mut script = self.script();
            script.lists.push(chapter.id);
            script.gate_lists
        };
        if gated {
            if let Ok(permit) = self.list_gate.acquire().await {
                permit.forget();
            }
        }
        let script = self.script();
        if let Some(err) = script.list_errors.get(&chapter.id) {
            return Err(err.clone());
        }
        let count = script
            .page_counts
            .get(&chapter.id)
            .copied()
            .unwrap_or(script.default_pages);
        Ok((0..count).map(PageDescriptor::new).collect())
    }

    async fn fetch_page_bytes(
        &self,
        chapter: &ChapterInfo,
        page: &PageDescriptor,
    ) -> Result<PageByteStream> {
        let (gated, failing, corrupt, stalled, panicking, claimed) = {
            let mut script = self.script();
            script.started.push((chapter.id, page.index));
            (
                script.gate_pages,
                script.failing_pages.contains(&page.index),
                script.corrupt_pages.contains(&page.index),
                script.stalled_pages.contains(&page.index),
                script.panicking_pages.contains(&page.index),
                script.claimed_lengths.get(&page.index).copied(),
            )
        };
        if panicking {
            panic!("page source crashed on page {}", page.index);
        }
        if failing {
            return Err(ReaderError::Network(format!(
                "connection reset on page {}",
                page.index
            )));
        }
        if stalled {
            return Ok(PageByteStream {
                content_length: None,
                chunks: Box::pin(stream::pending()),
            });
        }
        if gated {
            if let Ok(permit) = self.page_gate.acquire().await {
                permit.forget();
            }
        }

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let guard = ActiveGuard(Arc::clone(&self.active));

        let body = if corrupt {
            b"<html>503</html>".to_vec()
        } else {
            self.image.clone()
        };
        let mid = body.len() / 2;
        let chunks = vec![Ok(body[..mid].to_vec()), Ok(body[mid..].to_vec())];
        Ok(PageByteStream {
            content_length: Some(claimed.unwrap_or(body.len() as u64)),
            chunks: Box::pin(stream::iter(chunks).map(move |chunk| {
                let _active = &guard;
                chunk
            })),
        })
    }
}

/// Waits for `rx` to satisfy `pred`, failing the test after a few seconds.
pub async fn wait_for<T, F>(mut rx: watch::Receiver<T>, mut pred: F) -> T
where
    T: Clone,
    F: FnMut(&T) -> bool,
{
    let res = tokio::time::timeout(WAIT, async {
        loop {
            {
                let value = rx.borrow_and_update();
                if pred(&value) {
                    return value.clone();
                }
            }
            if rx.changed().await.is_err() {
                let value = rx.borrow();
                assert!(pred(&value), "state slot closed before condition held");
                return value.clone();
            }
        }
    })
    .await;
    match res {
        Ok(value) => value,
        Err(_) => panic!("timed out waiting for state"),
    }
}

pub async fn wait_page<F>(page: &ReaderPage, pred: F) -> PageState
where
    F: FnMut(&PageState) -> bool,
{
    let state = wait_for(page.subscribe(), pred).await;
    assert!(state.is_consistent(), "inconsistent page state: {:?}", state);
    state
}

pub async fn wait_chapter<F>(chapter: &ReaderChapter, pred: F) -> ChapterState
where
    F: FnMut(&ChapterState) -> bool,
{
    wait_for(chapter.subscribe(), pred).await
}

pub async fn eventually<F>(mut cond: F)
where
    F: FnMut() -> bool,
{
    let polled = tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "condition never became true");
}

use image::DynamicImage;
use ratatui::{
    Frame,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph},
};
use ratatui_image::{Resize, StatefulImage, picker::Picker, protocol::StatefulProtocol};
use std::future;
use std::sync::Arc;
use tokio::sync::watch;

use crate::backend::source::ChapterInfo;
use crate::reader::chapter::ChapterState;
use crate::reader::model::ReaderModel;
use crate::reader::page::{PageState, PageStatus};
use crate::reader::viewer::{ChapterSlot, Slot};

#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub enum AppState {
    #[default]
    Loading,
    Ready,
}

#[derive(Debug, Clone)]
pub enum PageView {
    NoChapter,
    ChapterLoading,
    ChapterError { message: String, retryable: bool },
    NoPages,
    Page {
        chapter_id: Option<i64>,
        index: usize,
        count: usize,
        state: PageState,
    },
}

impl PageView {
    pub fn of(model: &ReaderModel) -> Self {
        let Some(chapter) = model.current_chapter() else {
            return PageView::NoChapter;
        };
        match chapter.state() {
            ChapterState::Wait | ChapterState::Loading => PageView::ChapterLoading,
            ChapterState::Error(e) => PageView::ChapterError {
                message: e.to_string(),
                retryable: e.is_retryable(),
            },
            ChapterState::Loaded(pages) => {
                match pages.get(chapter.requested_page()) {
                    Some(page) => PageView::Page {
                        chapter_id: page.chapter().map(|c| c.info().id),
                        index: page.index(),
                        count: pages.len(),
                        state: page.state(),
                    },
                    None => PageView::NoPages,
                }
            }
        }
    }

    pub fn is_busy(&self) -> bool {
        match self {
            PageView::ChapterLoading => true,
            PageView::Page { state, .. } => matches!(
                state.status,
                PageStatus::Queued | PageStatus::Fetching | PageStatus::Decoding
            ),
            _ => false,
        }
    }

    pub fn status_label(&self) -> String {
        match self {
            PageView::NoChapter => "No chapter".to_string(),
            PageView::ChapterLoading => "Loading chapter".to_string(),
            PageView::ChapterError { .. } => "Chapter failed".to_string(),
            PageView::NoPages => "Empty chapter".to_string(),
            PageView::Page {
                index,
                count,
                state,
                ..
            } => {
                let status = match state.status {
                    PageStatus::Queued => "queued",
                    PageStatus::Fetching => "downloading",
                    PageStatus::Decoding => "decoding",
                    PageStatus::Ready => "ready",
                    PageStatus::Error => "failed",
                    PageStatus::Cancelled => "cancelled",
                };
                format!("Page {}/{} · {}", index + 1, count, status)
            }
        }
    }
}

/// Receivers for whatever the screen currently shows: the current chapter
/// slot, that chapter's state, and the requested page's state.
#[derive(Default)]
pub struct Watchers {
    window: Option<watch::Receiver<ChapterSlot>>,
    chapter: Option<watch::Receiver<ChapterState>>,
    page: Option<watch::Receiver<PageState>>,
}

impl Watchers {
    pub fn of(model: &ReaderModel) -> Self {
        let current = model.current_chapter();
        let page = current
            .as_ref()
            .and_then(|chapter| chapter.page(chapter.requested_page()));
        Self {
            window: Some(model.viewer().subscribe(Slot::Current)),
            chapter: current.map(|chapter| chapter.subscribe()),
            page: page.map(|page| page.subscribe()),
        }
    }

    pub async fn changed(&mut self) {
        tokio::select! {
            _ = changed(self.window.as_mut()) => {}
            _ = changed(self.chapter.as_mut()) => {}
            _ = changed(self.page.as_mut()) => {}
        }
    }
}

async fn changed<T>(rx: Option<&mut watch::Receiver<T>>) {
    if let Some(rx) = rx {
        if rx.changed().await.is_ok() {
            return;
        }
    }
    // A closed or missing channel never fires.
    future::pending::<()>().await;
}

struct PageImage {
    key: (i64, usize),
    image: Arc<DynamicImage>,
    protocol: StatefulProtocol,
}

pub struct App {
    pub state: AppState,
    pub loading_message: String,
    pub manga_title: String,
    pub model: Option<ReaderModel>,
    pub picker: Option<Picker>,
    page_image: Option<PageImage>,
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    pub fn new() -> Self {
        let picker = Picker::from_query_stdio().ok();

        Self {
            state: AppState::Loading,
            loading_message: "Initializing...".to_string(),
            manga_title: String::new(),
            model: None,
            picker,
            page_image: None,
        }
    }

    pub fn set_loading(&mut self, message: &str) {
        self.state = AppState::Loading;
        self.loading_message = message.to_string();
    }

    pub fn set_ready(&mut self, model: ReaderModel) {
        self.model = Some(model);
        self.state = AppState::Ready;
    }

    pub fn close(&mut self) {
        self.page_image = None;
        if let Some(model) = self.model.as_mut() {
            model.close();
        }
    }

    /// Build before drawing, so a change that lands mid-draw still wakes
    /// the loop.
    pub fn watchers(&self) -> Watchers {
        self.model.as_ref().map(Watchers::of).unwrap_or_default()
    }

    pub fn is_animating(&self) -> bool {
        match self.state {
            AppState::Loading => true,
            AppState::Ready => self.model.as_ref().is_some_and(|m| PageView::of(m).is_busy()),
        }
    }

    fn current_chapter_info(&self) -> Option<ChapterInfo> {
        let model = self.model.as_ref()?;
        model.current_chapter().map(|c| c.info().clone())
    }

    fn refresh_page_image(&mut self, view: &PageView) {
        let PageView::Page {
            chapter_id: Some(chapter_id),
            index,
            state,
            ..
        } = view
        else {
            self.page_image = None;
            return;
        };
        let Some(image) = state.image.as_ref() else {
            self.page_image = None;
            return;
        };
        let key = (*chapter_id, *index);
        if let Some(current) = &self.page_image {
            if current.key == key && Arc::ptr_eq(&current.image, image) {
                return;
            }
        }
        self.page_image = self.picker.as_ref().map(|picker| PageImage {
            key,
            image: image.clone(),
            protocol: picker.new_resize_protocol((**image).clone()),
        });
    }
}

pub fn ui(f: &mut Frame, app: &mut App) {
    match app.state {
        AppState::Loading => draw_loading_screen(f, app),
        AppState::Ready => draw_reader(f, app),
    }
}

fn spinner() -> &'static str {
    let spinner_frames = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    spinner_frames[(millis / 100) as usize % spinner_frames.len()]
}

fn draw_loading_screen(f: &mut Frame, app: &App) {
    let area = f.area();

    let block = Block::default()
        .borders(Borders::ALL)
        .title("Tachidesk Reader")
        .border_style(Style::default().fg(Color::Cyan));

    let inner = block.inner(area);
    f.render_widget(block, area);

    let center_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage(40),
            Constraint::Length(3),
            Constraint::Length(2),
            Constraint::Percentage(40),
        ])
        .split(inner);

    let loading_text = Line::from(vec![
        Span::styled(
            format!(" {} ", spinner()),
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::styled(
            "Loading...",
            Style::default()
                .fg(Color::White)
                .add_modifier(Modifier::BOLD),
        ),
    ]);
    f.render_widget(
        Paragraph::new(loading_text).alignment(Alignment::Center),
        center_layout[1],
    );

    let message = Paragraph::new(&*app.loading_message)
        .style(Style::default().fg(Color::DarkGray))
        .alignment(Alignment::Center);
    f.render_widget(message, center_layout[2]);
}

fn draw_reader(f: &mut Frame, app: &mut App) {
    let area = f.area();

    let root = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // chapter title
            Constraint::Min(5),    // page
            Constraint::Length(3), // status / progress
            Constraint::Length(3), // footer
        ])
        .split(area);

    let chapter = app.current_chapter_info();
    let view = app
        .model
        .as_ref()
        .map(PageView::of)
        .unwrap_or(PageView::NoChapter);
    app.refresh_page_image(&view);

    draw_header(f, root[0], &app.manga_title, chapter.as_ref());
    draw_page(f, root[1], &view, app.page_image.as_mut());
    draw_status(f, root[2], &view);
    draw_footer(f, root[3]);
}

fn draw_header(f: &mut Frame, area: Rect, manga_title: &str, chapter: Option<&ChapterInfo>) {
    let chapter_name = chapter.map(|c| c.to_string()).unwrap_or_default();
    let line = Line::from(vec![
        Span::styled(
            chapter_name,
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        ),
    ]);
    let p = Paragraph::new(line).block(
        Block::default()
            .borders(Borders::ALL)
            .title(manga_title.to_string())
            .border_style(Style::default().fg(Color::Cyan)),
    );
    f.render_widget(p, area);
}

fn draw_page(f: &mut Frame, area: Rect, view: &PageView, image: Option<&mut PageImage>) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray));
    let inner = block.inner(area);
    f.render_widget(block, area);

    if let Some(image) = image {
        let image_widget = StatefulImage::new().resize(Resize::Scale(None));
        f.render_stateful_widget(image_widget, inner, &mut image.protocol);
        return;
    }

    let (symbol, message, color) = match view {
        PageView::NoChapter => ("", "Nothing to read".to_string(), Color::DarkGray),
        PageView::ChapterLoading => (spinner(), "Loading chapter...".to_string(), Color::Cyan),
        PageView::ChapterError { message, retryable } => {
            let hint = if *retryable { " (R to retry)" } else { "" };
            ("✗", format!("{}{}", message, hint), Color::Red)
        }
        PageView::NoPages => ("", "This chapter has no pages".to_string(), Color::DarkGray),
        PageView::Page { state, .. } => match state.status {
            PageStatus::Error => (
                "✗",
                format!("{} (r to retry)", state.error.as_deref().unwrap_or("page failed")),
                Color::Red,
            ),
            PageStatus::Cancelled => ("", "Cancelled (r to retry)".to_string(), Color::DarkGray),
            // Ready without a picker means the terminal cannot show images.
            PageStatus::Ready => (
                "",
                "Page ready, image display unavailable".to_string(),
                Color::DarkGray,
            ),
            _ => (spinner(), "Loading page...".to_string(), Color::Cyan),
        },
    };

    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage(45),
            Constraint::Length(2),
            Constraint::Percentage(45),
        ])
        .split(inner);
    let text = Line::from(vec![
        Span::styled(format!("{} ", symbol), Style::default().fg(color)),
        Span::styled(message, Style::default().fg(color)),
    ]);
    f.render_widget(Paragraph::new(text).alignment(Alignment::Center), layout[1]);
}

fn draw_status(f: &mut Frame, area: Rect, view: &PageView) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));
    let label = view.status_label();

    if let PageView::Page { state, .. } = view {
        if matches!(state.status, PageStatus::Fetching | PageStatus::Decoding) {
            let gauge = Gauge::default()
                .block(block)
                .gauge_style(Style::default().fg(Color::Cyan))
                .ratio(f64::from(state.progress.clamp(0.0, 1.0)))
                .label(label);
            f.render_widget(gauge, area);
            return;
        }
    }

    let style = match view {
        PageView::ChapterError { .. } => Style::default().fg(Color::Red),
        PageView::Page { state, .. } if state.status == PageStatus::Error => {
            Style::default().fg(Color::Red)
        }
        _ => Style::default().fg(Color::White),
    };
    f.render_widget(Paragraph::new(label).style(style).block(block), area);
}

fn draw_footer(f: &mut Frame, area: Rect) {
    let text = Line::from(vec![
        Span::styled("←/→", Style::default().fg(Color::Yellow)),
        Span::raw(": page  "),
        Span::styled("n/p", Style::default().fg(Color::Yellow)),
        Span::raw(": chapter  "),
        Span::styled("r/R", Style::default().fg(Color::Yellow)),
        Span::raw(": retry page/chapter  "),
        Span::styled("q", Style::default().fg(Color::Yellow)),
        Span::raw(": quit"),
    ]);

    let p = Paragraph::new(text)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Cyan)),
        )
        .alignment(Alignment::Center);
    f.render_widget(p, area);
}

mod backend;
mod cli;
mod reader;
mod ui;

use backend::config::{Config, app_dir, config_path};
use backend::source::{ChapterPageSource, ImageCrateDecoder};
use backend::tachidesk::TachideskClient;
use cli::Cli;
use reader::ReaderOptions;
use reader::model::ReaderModel;
use ui::ui::{App, ui};

use clap::Parser;
use crossterm::{
    event::{Event, EventStream, KeyCode, KeyEventKind},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use futures::StreamExt;
use ratatui::{Terminal, backend::CrosstermBackend};
use std::{error::Error, fs::File, io, sync::Arc, time::Duration};

fn init_logging() {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    // The terminal belongs to the UI, so logs go to a file or nowhere.
    let path = app_dir(dirs::cache_dir()).join("reader.log");
    match File::create(&path) {
        Ok(file) => {
            builder.target(env_logger::Target::Pipe(Box::new(file)));
        }
        Err(_) => {
            builder.filter_level(log::LevelFilter::Off);
        }
    }
    builder.init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logging();

    let mut config = Config::load();
    if !config_path().exists() {
        config.save();
    }
    if let Some(server) = cli.server.clone() {
        config.server_url = server;
    }
    log::info!("reading manga {} from {}", cli.manga_id, config.server_url);
    let client = Arc::new(TachideskClient::new(&config)?);

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new();
    app.manga_title = format!("Manga #{}", cli.manga_id);

    let res = run_app(&mut terminal, &mut app, &cli, &config, client).await;
    app.close();

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        log::error!("{err}");
        eprintln!("{err}");
    }
    Ok(())
}

async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
    cli: &Cli,
    config: &Config,
    client: Arc<TachideskClient>,
) -> Result<(), Box<dyn Error>> {
    app.set_loading("Fetching chapters...");
    terminal.draw(|f| ui(f, app))?;

    let chapters = client.get_manga_chapters(cli.manga_id).await?;
    if chapters.is_empty() {
        return Err(format!("manga {} has no chapters", cli.manga_id).into());
    }
    log::info!("manga {} has {} chapters", cli.manga_id, chapters.len());

    let start = cli.start_chapter(chapters.iter().map(|c| c.index));
    let source: Arc<dyn ChapterPageSource> = client;
    let mut model = ReaderModel::new(
        source,
        Arc::new(ImageCrateDecoder),
        ReaderOptions::from(&config.reader),
        chapters,
    );
    model.open(start, cli.start_page());
    app.set_ready(model);

    let mut event_stream = EventStream::new();

    loop {
        let mut watchers = app.watchers();
        let animating = app.is_animating();
        terminal.draw(|f| ui(f, app))?;

        tokio::select! {
            // Spinner tick, only while something is loading
            _ = tokio::time::sleep(Duration::from_millis(100)), if animating => {}

            _ = watchers.changed() => {}

            Some(Ok(event)) = event_stream.next() => {
                if let Event::Key(key) = event {
                    if key.kind == KeyEventKind::Press && handle_reader_input(app, key.code) {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Returns true when the reader should quit.
fn handle_reader_input(app: &mut App, key: KeyCode) -> bool {
    let Some(model) = app.model.as_mut() else {
        return matches!(key, KeyCode::Char('q') | KeyCode::Esc);
    };
    match key {
        KeyCode::Char('q') | KeyCode::Esc => return true,
        KeyCode::Right | KeyCode::Char('l') | KeyCode::Char(' ') => {
            model.next_page();
        }
        KeyCode::Left | KeyCode::Char('h') => {
            model.previous_page();
        }
        KeyCode::Char('n') => {
            model.next_chapter();
        }
        KeyCode::Char('p') => {
            model.previous_chapter();
        }
        KeyCode::Char('r') => {
            if let Some(position) = model.position() {
                if !model.retry_page(position.page) {
                    log::debug!("page {} is not retryable", position.page);
                }
            }
        }
        KeyCode::Char('R') => {
            if !model.retry_chapter() {
                log::debug!("chapter is not retryable");
            }
        }
        _ => {}
    }
    false
}

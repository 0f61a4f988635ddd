use clap::Parser;

pub const HELP_KEYS: &str = "\
Key Bindings:
  Right / l / Space : Next page
  Left / h          : Previous page
  n / p             : Next / previous chapter
  r                 : Retry the current page
  R                 : Retry the current chapter
  Esc / q           : Quit
";

#[derive(Parser, Debug)]
#[command(
    name = "tachidesk-tui",
    version,
    about = "Read manga from a Tachidesk server in the terminal",
    after_help = HELP_KEYS
)]
pub struct Cli {
    /// Manga id on the server
    pub manga_id: i64,

    /// Chapter to start at, by its index on the server. Default: the first.
    #[arg(short, long)]
    pub chapter: Option<i64>,

    /// Page to start at, counting from 1
    #[arg(short, long, default_value = "1")]
    pub page: usize,

    /// Server URL, overrides the config file
    #[arg(short, long, value_name = "URL")]
    pub server: Option<String>,
}

impl Cli {
    pub fn start_chapter(&self, indices: impl IntoIterator<Item = i64>) -> usize {
        self.chapter
            .and_then(|wanted| indices.into_iter().position(|i| i == wanted))
            .unwrap_or(0)
    }

    pub fn start_page(&self) -> usize {
        self.page.saturating_sub(1)
    }
}

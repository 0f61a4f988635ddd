use async_trait::async_trait;
use futures::stream;
use serde::Deserialize;

use super::config::Config;
use super::source::{ChapterInfo, ChapterPageSource, PageByteStream, PageDescriptor};
use crate::reader::error::{ReaderError, Result};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChapterData {
    id: i64,
    manga_id: i64,
    index: i64,
    name: String,
    #[serde(default)]
    page_count: Option<i64>,
}

impl From<ChapterData> for ChapterInfo {
    fn from(c: ChapterData) -> Self {
        ChapterInfo {
            id: c.id,
            manga_id: c.manga_id,
            index: c.index,
            name: c.name,
            // The server reports -1 until it has fetched the chapter.
            page_count: c.page_count.and_then(|n| usize::try_from(n).ok()),
        }
    }
}

fn parse_chapter_list(chapters: Vec<ChapterData>) -> Vec<ChapterInfo> {
    let mut chapters: Vec<ChapterInfo> = chapters.into_iter().map(ChapterInfo::from).collect();
    chapters.sort_by_key(|c| c.index);
    chapters
}

#[derive(Clone)]
pub struct TachideskClient {
    client: reqwest::Client,
    base_url: String,
    credentials: Option<(String, Option<String>)>,
}

impl TachideskClient {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("tachidesk-tui/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            credentials: config
                .username
                .clone()
                .map(|user| (user, config.password.clone())),
        })
    }

    fn chapters_url(&self, manga_id: i64) -> String {
        format!("{}/api/v1/manga/{}/chapters", self.base_url, manga_id)
    }

    fn chapter_url(&self, manga_id: i64, index: i64) -> String {
        format!("{}/api/v1/manga/{}/chapter/{}", self.base_url, manga_id, index)
    }

    fn page_url(&self, manga_id: i64, index: i64, page: usize) -> String {
        format!(
            "{}/api/v1/manga/{}/chapter/{}/page/{}",
            self.base_url, manga_id, index, page
        )
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        let mut request = self.client.get(url);
        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, password.as_deref());
        }
        log::debug!("GET {}", url);
        Ok(request.send().await?.error_for_status()?)
    }

    pub async fn get_manga_chapters(&self, manga_id: i64) -> Result<Vec<ChapterInfo>> {
        let response = self.get(&self.chapters_url(manga_id)).await?;
        let chapters: Vec<ChapterData> = response.json().await?;
        Ok(parse_chapter_list(chapters))
    }

    /// Chapter detail. Asking for it makes the server resolve the page count.
    pub async fn get_chapter(&self, manga_id: i64, index: i64) -> Result<ChapterInfo> {
        let response = self.get(&self.chapter_url(manga_id, index)).await?;
        let chapter: ChapterData = response.json().await?;
        Ok(chapter.into())
    }
}

#[async_trait]
impl ChapterPageSource for TachideskClient {
    async fn fetch_page_list(&self, chapter: &ChapterInfo) -> Result<Vec<PageDescriptor>> {
        let detail = self.get_chapter(chapter.manga_id, chapter.index).await?;
        let count = detail.page_count.ok_or_else(|| {
            ReaderError::Network(format!("server did not report a page count for {}", chapter))
        })?;
        Ok((0..count)
            .map(|i| PageDescriptor {
                index: i,
                url: Some(self.page_url(chapter.manga_id, chapter.index, i)),
            })
            .collect())
    }

    async fn fetch_page_bytes(
        &self,
        chapter: &ChapterInfo,
        page: &PageDescriptor,
    ) -> Result<PageByteStream> {
        let url = page
            .url
            .clone()
            .unwrap_or_else(|| self.page_url(chapter.manga_id, chapter.index, page.index));
        let response = self.get(&url).await?;
        let content_length = response.content_length();

        // Yields each body chunk; stops after the first error.
        let chunks = stream::unfold(Some(response), |response| async move {
            let mut response = response?;
            match response.chunk().await {
                Ok(Some(bytes)) => Some((Ok(bytes.to_vec()), Some(response))),
                Ok(None) => None,
                Err(e) => Some((Err(ReaderError::from(e)), None)),
            }
        });

        Ok(PageByteStream {
            content_length,
            chunks: Box::pin(chunks),
        })
    }
}

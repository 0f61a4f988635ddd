use async_trait::async_trait;
use futures::stream::BoxStream;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;

use crate::reader::error::{ReaderError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterInfo {
    pub id: i64,
    pub manga_id: i64,
    pub index: i64,
    pub name: String,
    pub page_count: Option<usize>,
}

impl fmt::Display for ChapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (#{})", self.name, self.index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageDescriptor {
    pub index: usize,
    pub url: Option<String>,
}

impl PageDescriptor {
    #[cfg(test)]
    pub fn new(index: usize) -> Self {
        Self { index, url: None }
    }
}

pub struct PageByteStream {
    pub content_length: Option<u64>,
    pub chunks: BoxStream<'static, Result<Vec<u8>>>,
}

impl fmt::Debug for PageByteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageByteStream")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ChapterPageSource: Send + Sync {
    async fn fetch_page_list(&self, chapter: &ChapterInfo) -> Result<Vec<PageDescriptor>>;

    async fn fetch_page_bytes(
        &self,
        chapter: &ChapterInfo,
        page: &PageDescriptor,
    ) -> Result<PageByteStream>;
}

pub trait ImageDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ImageCrateDecoder;

impl ImageDecoder for ImageCrateDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage> {
        let reader = image::ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| ReaderError::Decode(e.to_string()))?;
        Ok(reader.decode()?)
    }
}

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReaderError {
    #[error("network error: {0}")]
    Network(String),
    #[error("could not decode page: {0}")]
    Decode(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("cancelled")]
    Cancelled,
}

impl ReaderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReaderError::Network(_) | ReaderError::Decode(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ReaderError::Cancelled)
    }
}

impl From<reqwest::Error> for ReaderError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(reqwest::StatusCode::NOT_FOUND) => ReaderError::NotFound(err.to_string()),
            _ => ReaderError::Network(err.to_string()),
        }
    }
}

impl From<image::ImageError> for ReaderError {
    fn from(err: image::ImageError) -> Self {
        ReaderError::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ReaderError>;

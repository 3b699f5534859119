//! Common error type and result alias used across the crate.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    /// Transport-level failure from the HTTP client, including timeouts.
    #[error("HTTP client error: {0}")]
    HttpClient(reqwest::Error),

    /// The remote service answered with a non-success status.
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// The byte stream is not the container format we understand.
    #[error("invalid image container: {0}")]
    Format(String),

    /// An embedded metadata payload failed to parse.
    #[error("metadata JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            AppError::Api { status, .. } => Some(*status),
            AppError::HttpClient(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

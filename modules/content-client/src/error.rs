use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContentError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Content API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Content API rejected the call ({code}): {message}")]
    Envelope { code: String, message: String },

    #[error("Invalid response body: {0}")]
    InvalidResponse(String),

    #[error("Invalid item: {0}")]
    InvalidItem(String),
}

pub type Result<T> = std::result::Result<T, ContentError>;

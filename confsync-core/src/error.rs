use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("bootstrap unavailable: {0}")]
    Bootstrap(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("download failure: {0}")]
    Download(String),

    #[error("resolution failure: {0}")]
    Resolution(String),

    #[error("delivery failure: {0}")]
    Delivery(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

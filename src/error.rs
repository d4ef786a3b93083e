use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed fetching '{url}': {reason}")]
    Fetch { url: String, reason: String },
    #[error("the front page could not be downloaded")]
    FrontPageUnavailable,
    #[error("invalid url '{0}'")]
    InvalidUrl(String),
}

use thiserror::Error;

/// Every failure surfaced by the SDK.
///
/// The type is `Clone` so a single outcome of a shared in-flight request can be
/// handed to every frame that awaited it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmbedError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("{context}: {detail}")]
    Transport { context: String, detail: String },
    #[error("{0}")]
    Cancelled(String),
    #[error("{0}")]
    VersionUnsupported(String),
    #[error("{0}")]
    ProtocolData(String),
    #[error("channel error: {0}")]
    Channel(String),
}

pub type EmbedResult<T> = Result<T, EmbedError>;

impl EmbedError {
    pub fn transport(context: impl Into<String>, detail: impl Into<String>) -> Self {
        EmbedError::Transport {
            context: context.into(),
            detail: detail.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EmbedError::Cancelled(_))
    }
}

impl From<reqwest::Error> for EmbedError {
    fn from(err: reqwest::Error) -> Self {
        EmbedError::transport("http request failed", err.to_string())
    }
}

use derive_more::From;
use std::sync::Arc;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, From)]
pub enum Error {
    #[from]
    Json(serde_json::Error),

    #[from]
    Http(reqwest::Error),

    #[from]
    WebSocket(tokio_tungstenite::tungstenite::Error),

    #[from]
    Io(std::io::Error),

    /// A cache fetch failed and there was no previous entry to fall back on.
    /// The source is shared so one failure can be handed to every waiting caller.
    FetchFailed { key: String, source: Arc<Error> },

    /// The supervisor has no live session to carry an outbound frame
    NotConnected,

    /// Rejected configuration value
    InvalidConfig(String),

    /// Transport-level failure that is not a library error (timeouts, remote close)
    Transport(String),

    /// Custom error message
    Custom(String),
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        match self {
            Self::FetchFailed { key, source } => write!(fmt, "fetch failed for {key}: {source}"),
            Self::NotConnected => write!(fmt, "not connected"),
            Self::InvalidConfig(msg) => write!(fmt, "invalid configuration: {msg}"),
            Self::Transport(msg) => write!(fmt, "transport failure: {msg}"),
            Self::Custom(msg) => write!(fmt, "{msg}"),
            _ => write!(fmt, "{self:?}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Json(e) => Some(e),
            Self::Http(e) => Some(e),
            Self::WebSocket(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::FetchFailed { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

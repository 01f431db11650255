use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("cancelled")]
    Cancelled,

    #[error("response error: {message}")]
    Response {
        message: String,
        status: Option<u16>,
    },

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("source file error: {0}")]
    Source(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ReviewError {
    /// Classify a transport failure from `reqwest`.
    ///
    /// Builder errors (bad URL, bad header) are configuration problems and will
    /// never succeed on retry. Everything else that fails before a status line
    /// arrives is treated as a connection failure.
    pub fn from_transport(e: reqwest::Error, timeout_ms: u64) -> Self {
        if e.is_timeout() {
            Self::Timeout(timeout_ms)
        } else if e.is_builder() {
            Self::Config(format!("invalid request: {e}"))
        } else {
            Self::Connection(e.to_string())
        }
    }

    /// Shorthand for a response error without an HTTP status.
    pub fn response(message: impl Into<String>) -> Self {
        Self::Response {
            message: message.into(),
            status: None,
        }
    }

    /// Returns true for transient errors that may succeed on retry.
    ///
    /// HTTP error statuses are deliberately excluded, 5xx included.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Human-readable message for the error notification.
    pub fn user_message(&self) -> String {
        match self {
            Self::Connection(_) => {
                "failed to connect to the inference server; is it running?".to_string()
            }
            Self::Timeout(ms) => format!("inference request timed out after {ms}ms"),
            Self::Cancelled => "cancelled".to_string(),
            Self::Response {
                message,
                status: Some(status),
            } => {
                // Servers put the useful part last; keep the tail.
                let preview: String = message
                    .chars()
                    .rev()
                    .take(200)
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                    .collect();
                let prefix = if preview.len() < message.len() {
                    "..."
                } else {
                    ""
                };
                if preview.trim().is_empty() {
                    format!("inference server returned HTTP {status}")
                } else {
                    format!("inference server returned HTTP {status}: {prefix}{preview}")
                }
            }
            Self::Response {
                message,
                status: None,
            } => format!("bad response from inference server: {message}"),
            Self::Validation(msg) => msg.clone(),
            Self::Decode(_) => "failed to decode response".to_string(),
            Self::Source(msg) => msg.clone(),
            Self::Config(msg) => format!("configuration error: {msg}"),
        }
    }
}

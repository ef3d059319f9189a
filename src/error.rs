use std::time::Duration;

/// Failures raised inside the image pipeline and the chat relay.
///
/// None of these are fatal to the process; each one is scoped to the request
/// that produced it and is rendered into that request's response body.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("upstream {url} did not answer within {}s", .timeout.as_secs_f32())]
    UpstreamTimeout { url: String, timeout: Duration },

    #[error("upstream {url} unavailable: {reason}")]
    UpstreamUnavailable { url: String, reason: String },

    #[error("image decode failed: {0}")]
    Decode(String),

    #[error("image encode failed: {0}")]
    Encode(String),

    #[error("chat provider is not configured (missing API key)")]
    ProviderUnconfigured,

    #[error("chat stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("history store error: {0}")]
    Persistence(String),

    #[error("transcode worker failed: {0}")]
    Offload(String),
}

impl RelayError {
    /// Classifies a reqwest failure for a call against `url`.
    pub fn from_reqwest(url: &str, timeout: Duration, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RelayError::UpstreamTimeout {
                url: url.to_string(),
                timeout,
            }
        } else {
            RelayError::UpstreamUnavailable {
                url: url.to_string(),
                reason: err.to_string(),
            }
        }
    }

    pub fn unavailable(url: &str, reason: impl Into<String>) -> Self {
        RelayError::UpstreamUnavailable {
            url: url.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<rusqlite::Error> for RelayError {
    fn from(err: rusqlite::Error) -> Self {
        RelayError::Persistence(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

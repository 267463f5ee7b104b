use relay_core::ProducerError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("provider returned status={status} body={body}")]
    Status { status: u16, body: String },

    #[error("provider error: {0}")]
    Api(String),

    #[error("stream parse error: {0}")]
    StreamParse(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(e: serde_json::Error) -> Self {
        Self::StreamParse(e.to_string())
    }
}

impl From<LlmError> for ProducerError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::StreamParse(_) => ProducerError::Malformed(e.to_string()),
            other => ProducerError::Backend(other.to_string()),
        }
    }
}

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("upstream status={status} body={body}")]
    Status { status: u16, body: String },

    #[error("upstream stream error type={error_type} message={message}")]
    Api { error_type: String, message: String },

    #[error("stream parse error: {0}")]
    StreamParse(String),
}

impl LlmError {
    /// HTTP status the upstream reported for this failure, if any.
    ///
    /// Errors delivered inside the event stream carry no status line, so the
    /// Anthropic error type is mapped onto the status the same error would
    /// have produced on the initial response.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Api { error_type, .. } => status_for_error_type(error_type),
            _ => None,
        }
    }
}

fn status_for_error_type(error_type: &str) -> Option<u16> {
    let status = match error_type {
        "invalid_request_error" => 400,
        "authentication_error" => 401,
        "permission_error" => 403,
        "not_found_error" => 404,
        "request_too_large" => 413,
        "rate_limit_error" => 429,
        "api_error" => 500,
        "overloaded_error" => 529,
        _ => return None,
    };
    Some(status)
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

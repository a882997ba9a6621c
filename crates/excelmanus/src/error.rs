use std::fmt;

/// Error types that can occur when interacting with LLM providers.
#[derive(Debug)]
pub enum LlmError {
    /// HTTP request/response errors
    HttpError(String),
    /// Authentication and authorization errors
    AuthError(String),
    /// Invalid request parameters or format
    InvalidRequest(String),
    /// Errors returned by the LLM provider
    ProviderError(String),
    /// API response parsing or format error
    ResponseFormatError { message: String, raw_response: String },
    /// JSON serialization/deserialization errors
    JsonError(String),
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::HttpError(e) => write!(f, "HTTP Error: {}", e),
            LlmError::AuthError(e) => write!(f, "Auth Error: {}", e),
            LlmError::InvalidRequest(e) => write!(f, "Invalid Request: {}", e),
            LlmError::ProviderError(e) => write!(f, "Provider Error: {}", e),
            LlmError::ResponseFormatError {
                message,
                raw_response,
            } => write!(
                f,
                "Response Format Error: {}. Raw response: {}",
                message, raw_response
            ),
            LlmError::JsonError(e) => write!(f, "JSON Parse Error: {}", e),
        }
    }
}

impl std::error::Error for LlmError {}

impl From<serde_json::Error> for LlmError {
    fn from(err: serde_json::Error) -> Self {
        LlmError::JsonError(format!(
            "{} at line {} column {}",
            err,
            err.line(),
            err.column()
        ))
    }
}

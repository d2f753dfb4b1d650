use thiserror::Error;

/// Errors talking to the Anthropic API.
#[derive(Debug, Error)]
pub enum AnthropicError {
    /// No API key configured.
    #[error("no API key configured (set ANTHROPIC_API_KEY or api_key in meshjobs.toml)")]
    MissingApiKey,

    /// HTTP 429.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Any other non-success status, with the body as message.
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

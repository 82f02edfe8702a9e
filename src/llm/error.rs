//! Provider error types with fallback classification.
//!
//! Distinguishes between transient errors (try the next provider) and hard errors
//! (stop the cascade and fall back to the rule-based extractor).

/// Error from a text-generation provider call.
#[derive(Debug)]
pub struct ProviderError {
    /// The kind of error
    pub kind: ProviderErrorKind,
    /// HTTP status code, if applicable
    pub status_code: Option<u16>,
    /// Error message
    pub message: String,
}

impl ProviderError {
    /// Create a rate limit / quota error.
    pub fn rate_limited(message: String) -> Self {
        Self {
            kind: ProviderErrorKind::RateLimited,
            status_code: Some(429),
            message,
        }
    }

    /// Create a server error.
    pub fn server_error(status_code: u16, message: String) -> Self {
        Self {
            kind: ProviderErrorKind::ServerError,
            status_code: Some(status_code),
            message,
        }
    }

    /// Create a client error (bad request, auth, etc.).
    pub fn client_error(status_code: u16, message: String) -> Self {
        Self {
            kind: ProviderErrorKind::ClientError,
            status_code: Some(status_code),
            message,
        }
    }

    /// Create a network error.
    pub fn network_error(message: String) -> Self {
        Self {
            kind: ProviderErrorKind::NetworkError,
            status_code: None,
            message,
        }
    }

    /// Create a parse error.
    pub fn parse_error(message: String) -> Self {
        Self {
            kind: ProviderErrorKind::ParseError,
            status_code: None,
            message,
        }
    }

    /// Build an error from a non-success HTTP response.
    pub fn from_status(status_code: u16, body: &str) -> Self {
        match classify_http_status(status_code) {
            ProviderErrorKind::RateLimited => Self::rate_limited(body.to_string()),
            ProviderErrorKind::ClientError => Self::client_error(status_code, body.to_string()),
            _ => Self::server_error(status_code, body.to_string()),
        }
    }

    /// Build an error from a reqwest transport failure.
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::network_error(format!("Request timeout: {}", err))
        } else if err.is_connect() {
            Self::network_error(format!("Connection failed: {}", err))
        } else {
            Self::network_error(format!("Request failed: {}", err))
        }
    }

    /// Whether the cascade should move on to the next provider.
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (HTTP {}): {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Classification of provider errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Rate limited or quota exhausted (429)
    RateLimited,
    /// Server error (500, 502, 503, 504)
    ServerError,
    /// Client error (400, 401, 403, 404)
    ClientError,
    /// Network error (connection failed, timeout)
    NetworkError,
    /// Response could not be parsed into a brief
    ParseError,
}

impl ProviderErrorKind {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderErrorKind::RateLimited
                | ProviderErrorKind::ServerError
                | ProviderErrorKind::NetworkError
        )
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderErrorKind::RateLimited => write!(f, "Rate limited"),
            ProviderErrorKind::ServerError => write!(f, "Server error"),
            ProviderErrorKind::ClientError => write!(f, "Client error"),
            ProviderErrorKind::NetworkError => write!(f, "Network error"),
            ProviderErrorKind::ParseError => write!(f, "Parse error"),
        }
    }
}

/// Parse HTTP status code into error kind.
pub fn classify_http_status(status: u16) -> ProviderErrorKind {
    match status {
        429 => ProviderErrorKind::RateLimited,
        500 | 502 | 503 | 504 => ProviderErrorKind::ServerError,
        400..=499 => ProviderErrorKind::ClientError,
        _ => ProviderErrorKind::ServerError,
    }
}

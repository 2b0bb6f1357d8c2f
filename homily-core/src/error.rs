use reqwest::StatusCode;
use std::error::Error as _;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("download cancelled")]
    Cancelled,

    #[error("message `{0}` has no audio url")]
    MissingUrl(String),

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("HTTP request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid persisted data: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("connection closed after {received} of {expected} bytes")]
    Truncated { expected: u64, received: u64 },

    #[error("Storage limit reached")]
    StorageLimit,

    #[error("download queue is no longer running")]
    QueueClosed,

    #[error("{0}")]
    Transfer(String),
}

/// 可重试错误的类别，决定重试前的等待时间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Network,
    Tls,
}

const TLS_PATTERNS: &[&str] = &[
    "ssl",
    "tls",
    "handshake",
    "bad record mac",
    "decryption failed",
    "record overflow",
    "wrong version number",
];

const NETWORK_PATTERNS: &[&str] = &[
    "econnreset",
    "econnrefused",
    "econnaborted",
    "etimedout",
    "enotfound",
    "enetunreach",
    "ehostunreach",
    "epipe",
    "socket hang up",
    "connection reset",
    "connection refused",
    "connection aborted",
    "connection closed",
    "broken pipe",
    "timed out",
    "timeout",
    "dns error",
    "failed to lookup address",
    "network is unreachable",
    "network connection was lost",
    "network request failed",
    "unexpected eof",
    "error sending request",
    "error decoding response body",
];

/// 按错误信息判断是否为可重试的瞬时错误，TLS 类优先
pub fn classify_message(message: &str) -> Option<RetryClass> {
    let lower = message.to_lowercase();
    if TLS_PATTERNS.iter().any(|p| lower.contains(p)) {
        Some(RetryClass::Tls)
    } else if NETWORK_PATTERNS.iter().any(|p| lower.contains(p)) {
        Some(RetryClass::Network)
    } else {
        None
    }
}

impl Error {
    pub fn transfer(message: impl Into<String>) -> Self {
        Self::Transfer(message.into())
    }

    /// 包含完整错误链的描述
    pub fn detailed_message(&self) -> String {
        let mut message = self.to_string();
        let mut source = self.source();
        while let Some(err) = source {
            let text = err.to_string();
            if !message.contains(&text) {
                message.push_str(": ");
                message.push_str(&text);
            }
            source = err.source();
        }
        message
    }

    pub fn retry_class(&self) -> Option<RetryClass> {
        match self {
            Self::Cancelled
            | Self::MissingUrl(_)
            | Self::StorageLimit
            | Self::QueueClosed
            | Self::Serde(_) => None,
            Self::Truncated { .. } => Some(RetryClass::Network),
            Self::HttpStatus { status, .. } => (status.is_server_error()
                || *status == StatusCode::REQUEST_TIMEOUT
                || *status == StatusCode::TOO_MANY_REQUESTS)
                .then_some(RetryClass::Network),
            Self::Network(_) | Self::Io(_) | Self::Transfer(_) => {
                classify_message(&self.detailed_message())
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retry_class().is_some()
    }
}

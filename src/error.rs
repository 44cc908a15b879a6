use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Codec error ({encoding}): {message}")]
    Codec { encoding: String, message: String },

    #[error("Upstream request timed out after {0}s")]
    Timeout(u64),

    #[error("Request cancelled: {0}")]
    Cancelled(String),

    #[error("URI error: {0}")]
    Uri(String),
}

impl ProxyError {
    pub fn codec(encoding: &str, err: impl std::fmt::Display) -> Self {
        ProxyError::Codec {
            encoding: encoding.to_string(),
            message: err.to_string(),
        }
    }

    /// The client went away before the exchange finished; nothing should be written back.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ProxyError::Cancelled(_))
    }
}

impl From<hyper_util::client::legacy::Error> for ProxyError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        if let Some(source) = std::error::Error::source(&err)
            .and_then(|e| e.downcast_ref::<hyper::Error>())
        {
            if source.is_canceled() {
                return ProxyError::Cancelled(err.to_string());
            }
        }
        if err.is_connect() {
            ProxyError::Connection(err.to_string())
        } else {
            ProxyError::Http(err.to_string())
        }
    }
}

impl From<http::header::InvalidHeaderValue> for ProxyError {
    fn from(err: http::header::InvalidHeaderValue) -> Self {
        ProxyError::Http(format!("invalid header value: {}", err))
    }
}

impl From<http::uri::InvalidUri> for ProxyError {
    fn from(err: http::uri::InvalidUri) -> Self {
        ProxyError::Uri(err.to_string())
    }
}

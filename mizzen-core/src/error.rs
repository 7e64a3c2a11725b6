//! Error types shared across the Mizzen framework
//!
//! Every failure surfaced to a caller carries one of the stable kinds in
//! [`ErrorKind`]; cluster policies and filters dispatch on the kind rather
//! than on exception downcasting.

/// Standard error type for Mizzen operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A response or queue deadline expired
    #[error("timeout: {0}")]
    Timeout(String),

    /// Connection lost, write failed, or the peer sent an unreadable frame
    #[error("network error: {0}")]
    Network(String),

    /// Body encode/decode failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The remote service implementation raised; payload preserved verbatim
    #[error("service exception: {message}")]
    Biz {
        message: String,
        /// Serialized form of whatever the service threw, untouched
        payload: Vec<u8>,
    },

    /// The peer reported a failure without any usable detail
    #[error("unknown remote failure: {0}")]
    Unknown(String),

    /// No provider available, or every invoker was filtered out
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A worker pool or rate limiting filter rejected the call
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    /// Extension plane failure (unknown name, unresolved adaptive key)
    #[error("{0}")]
    Extension(String),

    /// Invalid argument provided
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The target component has been destroyed
    #[error("destroyed: {0}")]
    Destroyed(String),

    /// Internal framework error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for Mizzen operations
pub type Result<T> = std::result::Result<T, Error>;

/// Stable error categories surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Timeout,
    Network,
    Serialization,
    Biz,
    Unknown,
    Forbidden,
    LimitExceeded,
    Internal,
}

impl Error {
    /// Build a biz error with no preserved payload
    pub fn biz(message: impl Into<String>) -> Self {
        Error::Biz {
            message: message.into(),
            payload: Vec::new(),
        }
    }

    /// Get the stable kind for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Network(_) => ErrorKind::Network,
            Error::Serialization(_) => ErrorKind::Serialization,
            Error::Biz { .. } => ErrorKind::Biz,
            Error::Unknown(_) => ErrorKind::Unknown,
            Error::Forbidden(_) => ErrorKind::Forbidden,
            Error::LimitExceeded(_) => ErrorKind::LimitExceeded,
            Error::Extension(_)
            | Error::InvalidArgument(_)
            | Error::Destroyed(_)
            | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True when this error came from the remote service implementation
    pub fn is_biz(&self) -> bool {
        matches!(self, Error::Biz { .. })
    }

    /// Whether a cluster policy may try another invoker after this error
    pub fn is_retryable(&self) -> bool {
        !self.is_biz()
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::TimedOut => Error::Timeout(error.to_string()),
            _ => Error::Network(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_mapping() {
        assert_eq!(Error::Timeout("t".into()).kind(), ErrorKind::Timeout);
        assert_eq!(Error::biz("boom").kind(), ErrorKind::Biz);
        assert_eq!(Error::Forbidden("f".into()).kind(), ErrorKind::Forbidden);
        assert_eq!(Error::Extension("e".into()).kind(), ErrorKind::Internal);
    }

    #[test]
    fn biz_is_not_retryable() {
        assert!(!Error::biz("boom").is_retryable());
        assert!(Error::Network("down".into()).is_retryable());
        assert!(Error::Timeout("late".into()).is_retryable());
    }

    #[test]
    fn io_error_conversion() {
        let e: Error = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into();
        assert_eq!(e.kind(), ErrorKind::Network);

        let e: Error = std::io::Error::new(std::io::ErrorKind::TimedOut, "late").into();
        assert_eq!(e.kind(), ErrorKind::Timeout);
    }
}

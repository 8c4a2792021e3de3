//! クレート共通のエラー型

use thiserror::Error;

/// highlive全体で使うエラー型
#[derive(Error, Debug)]
pub enum HighliveError {
    /// I/O error when reading or writing files
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Network operation failed
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// WebSocket transport failed
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// SQLite error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// 不正なフレーム
    #[error("Decode error: {reason}")]
    Decode { reason: String },

    /// プロトコル違反（ハンドシェイク失敗など）
    #[error("Protocol error: {reason}")]
    Protocol { reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    /// 要約サービスの失敗
    #[error("Summarizer error: {0}")]
    Summarizer(String),

    /// ライフサイクルの不整合。外部要因ではなくバグを示す
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// Generic error with context
    #[error("Error in {context}: {message}")]
    Generic { context: String, message: String },
}

impl HighliveError {
    /// Create a new generic error with context
    pub fn generic(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Generic {
            context: context.into(),
            message: message.into(),
        }
    }

    pub fn decode(reason: impl Into<String>) -> Self {
        Self::Decode {
            reason: reason.into(),
        }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant(message.into())
    }

    /// 再接続で回復しうるエラーかどうか
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Network(_) | Self::WebSocket(_) | Self::Protocol { .. }
        )
    }
}

pub type HighliveResult<T> = Result<T, HighliveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HighliveError::generic("merge", "broken file");
        assert_eq!(err.to_string(), "Error in merge: broken file");

        let err = HighliveError::decode("too few fields");
        assert_eq!(err.to_string(), "Decode error: too few fields");
    }

    #[test]
    fn test_transient_classification() {
        assert!(HighliveError::protocol("handshake rejected").is_transient());
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(HighliveError::from(io).is_transient());
        assert!(!HighliveError::invariant("missing session").is_transient());
        assert!(!HighliveError::Summarizer("bad output".into()).is_transient());
    }
}

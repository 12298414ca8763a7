//! Log records produced from service output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which output stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogStream::Stdout => write!(f, "stdout"),
            LogStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// One line of service output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub service: String,
    pub tag: String,
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub payload: String,
}

impl LogRecord {
    pub fn new(
        service: impl Into<String>,
        tag: impl Into<String>,
        stream: LogStream,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            tag: tag.into(),
            timestamp: Utc::now(),
            stream,
            payload: payload.into(),
        }
    }

    /// Render as a single JSON document with `tag_prefix` prepended to the tag.
    pub fn to_json_line(&self, tag_prefix: &str) -> String {
        serde_json::json!({
            "service": self.service,
            "tag": format!("{}{}", tag_prefix, self.tag),
            "timestamp": self.timestamp.to_rfc3339(),
            "stream": self.stream,
            "payload": self.payload,
        })
        .to_string()
    }
}

use crate::model::AppendToken;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Errors raised by a table store or ingest channel implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// The store refused the operation (conflicting DDL, rejected row, ...).
    #[error("rejected: {0}")]
    Rejected(String),

    /// The channel's background committer stopped before the request.
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Run-fatal errors of a refresh. None of them are retried inside a run.
#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("failed to fetch {target}: {message}")]
    SourceFetch { target: String, message: String },

    #[error("malformed data for indicator {indicator}: {message}")]
    MalformedData { indicator: String, message: String },

    #[error("cannot prepare staging table {table}: {source}")]
    StagingPrepare {
        table: String,
        #[source]
        source: StoreError,
    },

    #[error("cannot open ingest channel on {table}: {source}")]
    StreamOpen {
        table: String,
        #[source]
        source: StoreError,
    },

    #[error("append of row {token} rejected: {source}")]
    StreamAppend {
        token: AppendToken,
        #[source]
        source: StoreError,
    },

    #[error("cannot read committed offset: {source}")]
    CommitPoll {
        #[source]
        source: StoreError,
    },

    #[error(
        "rows not committed after {attempts} polls (expected token {expected}, last acknowledged {})",
        .last_acknowledged.map(|t| t.to_string()).unwrap_or_else(|| "none".into())
    )]
    CommitTimeout {
        expected: AppendToken,
        last_acknowledged: Option<AppendToken>,
        attempts: u32,
    },

    #[error("cannot swap {staging} into {production}: {source}")]
    Swap {
        production: String,
        staging: String,
        #[source]
        source: StoreError,
    },

    #[error("run cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RefreshError {
    pub fn fetch(target: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::SourceFetch {
            target: target.into(),
            message: message.to_string(),
        }
    }

    pub fn malformed(indicator: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::MalformedData {
            indicator: indicator.into(),
            message: message.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SourceFetch { .. } => ErrorKind::SourceFetch,
            Self::MalformedData { .. } => ErrorKind::MalformedData,
            Self::StagingPrepare { .. } => ErrorKind::StagingPrepare,
            Self::StreamOpen { .. } => ErrorKind::StreamOpen,
            Self::StreamAppend { .. } => ErrorKind::StreamAppend,
            Self::CommitPoll { .. } => ErrorKind::CommitPoll,
            Self::CommitTimeout { .. } => ErrorKind::CommitTimeout,
            Self::Swap { .. } => ErrorKind::Swap,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Config(_) => ErrorKind::Config,
        }
    }
}

/// Serializable classification of a [`RefreshError`], reported in run outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SourceFetch,
    MalformedData,
    StagingPrepare,
    StreamOpen,
    StreamAppend,
    CommitPoll,
    CommitTimeout,
    Swap,
    Cancelled,
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SourceFetch => "SourceFetchError",
            Self::MalformedData => "MalformedDataError",
            Self::StagingPrepare => "StagingPrepareError",
            Self::StreamOpen => "StreamOpenError",
            Self::StreamAppend => "StreamAppendError",
            Self::CommitPoll => "CommitPollError",
            Self::CommitTimeout => "CommitTimeoutError",
            Self::Swap => "SwapError",
            Self::Cancelled => "Cancelled",
            Self::Config => "ConfigError",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_both_tokens() {
        let err = RefreshError::CommitTimeout {
            expected: AppendToken::new(9),
            last_acknowledged: None,
            attempts: 3,
        };
        assert_eq!(err.kind(), ErrorKind::CommitTimeout);
        assert_eq!(
            err.to_string(),
            "rows not committed after 3 polls (expected token 9, last acknowledged none)"
        );
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::StagingPrepare).unwrap();
        assert_eq!(json, "\"staging_prepare\"");
        assert_eq!(ErrorKind::Swap.to_string(), "SwapError");
    }
}

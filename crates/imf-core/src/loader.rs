//! Streaming Loader: an order-preserving conduit onto an ingest channel.

use tracing::{debug, info, warn};

use crate::error::{RefreshError, StoreError};
use crate::model::{AppendToken, Row};
use crate::{IngestChannel, StreamingIngest};

const PROGRESS_EVERY: u64 = 10_000;

pub struct StreamingLoader<'a> {
    ingest: &'a dyn StreamingIngest,
}

impl<'a> StreamingLoader<'a> {
    pub fn new(ingest: &'a dyn StreamingIngest) -> Self {
        Self { ingest }
    }

    pub async fn open(&self, table: &str) -> Result<LoaderChannel, RefreshError> {
        let inner = self
            .ingest
            .open_channel(table)
            .await
            .map_err(|source| RefreshError::StreamOpen {
                table: table.to_string(),
                source,
            })?;
        info!("Channel opened on {}", table);
        Ok(LoaderChannel::new(table, inner))
    }
}

/// An open ingest channel.
///
/// Release is scoped: call [`LoaderChannel::close`] on every exit path. If
/// the handle is dropped while still open (panic, cancelled future) the
/// close is handed to the runtime instead of being lost.
pub struct LoaderChannel {
    table: String,
    inner: Option<Box<dyn IngestChannel>>,
    next: AppendToken,
}

impl LoaderChannel {
    pub(crate) fn new(table: &str, inner: Box<dyn IngestChannel>) -> Self {
        Self {
            table: table.to_string(),
            inner: Some(inner),
            next: AppendToken::FIRST,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Number of rows accepted so far.
    pub fn appended(&self) -> u64 {
        self.next.value()
    }

    /// Push one row. Tokens must arrive as `0, 1, 2, ...` with no gaps; the
    /// call returns once the sink has accepted the row, not once it is committed.
    pub async fn append(&mut self, row: &Row, token: AppendToken) -> Result<(), RefreshError> {
        if token != self.next {
            return Err(RefreshError::StreamAppend {
                token,
                source: StoreError::Rejected(format!("out of order, expected token {}", self.next)),
            });
        }
        let inner = self.inner.as_mut().ok_or_else(|| RefreshError::StreamAppend {
            token,
            source: StoreError::ChannelClosed("append after close"),
        })?;
        inner
            .append_row(row, token)
            .await
            .map_err(|source| RefreshError::StreamAppend { token, source })?;
        self.next = token.next();
        if self.next.value() % PROGRESS_EVERY == 0 {
            debug!("Appended {} rows to {}", self.next.value(), self.table);
        }
        Ok(())
    }

    pub async fn latest_acknowledged(&self) -> Result<Option<AppendToken>, RefreshError> {
        let inner = self.inner.as_ref().ok_or_else(|| RefreshError::CommitPoll {
            source: StoreError::ChannelClosed("poll after close"),
        })?;
        inner
            .latest_committed_token()
            .await
            .map_err(|source| RefreshError::CommitPoll { source })
    }

    pub async fn close(mut self) -> Result<(), StoreError> {
        match self.inner.take() {
            Some(inner) => {
                let result = inner.close().await;
                debug!("Channel on {} closed", self.table);
                result
            }
            None => Ok(()),
        }
    }
}

impl Drop for LoaderChannel {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        warn!("Channel on {} dropped while open, closing in background", self.table);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let table = self.table.clone();
                handle.spawn(async move {
                    if let Err(e) = inner.close().await {
                        warn!(error = %e, "background close of channel on {} failed", table);
                    }
                });
            }
            Err(_) => warn!("no runtime to close channel on {}", self.table),
        }
    }
}

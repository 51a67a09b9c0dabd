//! Commit Watcher: the pipeline's only bounded wait.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::CommitSpec;
use crate::error::RefreshError;
use crate::loader::LoaderChannel;
use crate::model::AppendToken;

/// Proof that every appended row of the run was acknowledged.
///
/// Only [`CommitWatcher::wait_for_commit`] creates one, and the swap
/// coordinator consumes it, so a swap cannot be issued without it.
#[derive(Debug)]
pub struct CommitReceipt {
    last_token: Option<AppendToken>,
    polls: u32,
}

impl CommitReceipt {
    pub fn last_token(&self) -> Option<AppendToken> {
        self.last_token
    }

    pub fn polls(&self) -> u32 {
        self.polls
    }
}

#[derive(Debug, Clone)]
pub struct CommitWatcher {
    max_attempts: u32,
    interval: Duration,
}

impl CommitWatcher {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    pub fn from_spec(spec: &CommitSpec) -> Self {
        Self::new(spec.poll_attempts, spec.poll_interval())
    }

    /// Poll the channel's acknowledged token once per interval until it
    /// equals `expected`. `None` (an empty run) succeeds without polling.
    ///
    /// Fixed interval, no backoff. At most `max_attempts` polls.
    pub async fn wait_for_commit(
        &self,
        channel: &LoaderChannel,
        expected: Option<AppendToken>,
        cancel: &CancellationToken,
    ) -> Result<CommitReceipt, RefreshError> {
        let Some(expected) = expected else {
            debug!("No rows appended, nothing to wait for");
            return Ok(CommitReceipt {
                last_token: None,
                polls: 0,
            });
        };

        let mut last_acknowledged = None;
        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                return Err(RefreshError::Cancelled);
            }
            last_acknowledged = channel.latest_acknowledged().await?;
            if last_acknowledged == Some(expected) {
                info!("All rows committed after {} poll(s)", attempt);
                return Ok(CommitReceipt {
                    last_token: Some(expected),
                    polls: attempt,
                });
            }
            debug!(
                "Poll attempt {}/{}: acknowledged {:?}, expecting {}",
                attempt, self.max_attempts, last_acknowledged, expected
            );
            if attempt < self.max_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RefreshError::Cancelled),
                    _ = tokio::time::sleep(self.interval) => {}
                }
            }
        }

        error!("Timeout waiting for rows to commit on {}", channel.table());
        Err(RefreshError::CommitTimeout {
            expected,
            last_acknowledged,
            attempts: self.max_attempts,
        })
    }
}

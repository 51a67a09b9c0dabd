//! Pipeline Orchestrator.
//!
//! ```text
//! FETCHING -> RESHAPING -> STAGING_READY -> STREAMING -> AWAITING_COMMIT -> SWAPPED
//!     \            \              \              \               \
//!      +------------+--------------+--------------+---------------+--> ABORTED
//! ```
//!
//! Production is only touched by the final swap. Every abort after the
//! channel is opened still closes the channel; the staging table is left as
//! is for inspection and is truncated by the next run.

use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RefreshSpec;
use crate::error::{ErrorKind, RefreshError};
use crate::loader::{LoaderChannel, StreamingLoader};
use crate::model::{AppendToken, IndicatorDataset, Row};
use crate::reshape::reshape;
use crate::staging::StagingArea;
use crate::swap::SwapCoordinator;
use crate::watcher::{CommitReceipt, CommitWatcher};
use crate::{CatalogSource, StreamingIngest, TableStore};

/// How often (in rows) the append loop checks for cancellation.
const CANCEL_CHECK_EVERY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Fetching,
    Reshaping,
    StagingReady,
    Streaming,
    AwaitingCommit,
    Swapped,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Replaced,
    Aborted,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortReason {
    pub kind: ErrorKind,
    pub message: String,
    /// State the run was in when it failed
    pub state: RunState,
}

/// Externally observable result of one run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub status: RunStatus,
    pub row_count: usize,
    pub production_table: String,
    pub ingestion_timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<AbortReason>,
}

impl RunOutcome {
    pub fn is_replaced(&self) -> bool {
        self.status == RunStatus::Replaced
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            None => write!(
                f,
                "Streamed {} rows into {}",
                self.row_count, self.production_table
            ),
            Some(reason) => write!(
                f,
                "Aborted during {:?} with {}: {} ({} unchanged)",
                reason.state, reason.kind, reason.message, self.production_table
            ),
        }
    }
}

pub struct RefreshPipeline {
    spec: RefreshSpec,
    catalog: Arc<dyn CatalogSource>,
    store: Arc<dyn TableStore>,
    ingest: Arc<dyn StreamingIngest>,
}

impl RefreshPipeline {
    pub fn new(
        spec: RefreshSpec,
        catalog: Arc<dyn CatalogSource>,
        store: Arc<dyn TableStore>,
        ingest: Arc<dyn StreamingIngest>,
    ) -> Self {
        Self {
            spec,
            catalog,
            store,
            ingest,
        }
    }

    /// Execute one run stamped with the current time.
    pub async fn run(&self, cancel: CancellationToken) -> RunOutcome {
        self.run_at(Utc::now(), cancel).await
    }

    /// Execute one run. Never panics on collaborator failure; every error
    /// ends in an aborted outcome.
    pub async fn run_at(
        &self,
        ingestion_timestamp: DateTime<Utc>,
        cancel: CancellationToken,
    ) -> RunOutcome {
        let production = self.spec.destination.production().to_string();
        info!(
            pipeline = %self.spec.name,
            "Starting refresh of {} at {}", production, ingestion_timestamp
        );

        let mut state = RunState::Fetching;
        let result = self.execute(ingestion_timestamp, &cancel, &mut state).await;
        match result {
            Ok(row_count) => {
                let outcome = RunOutcome {
                    status: RunStatus::Replaced,
                    row_count,
                    production_table: production,
                    ingestion_timestamp,
                    reason: None,
                };
                info!("{}", outcome);
                outcome
            }
            Err(e) => {
                let failed_in = state;
                advance(&mut state, RunState::Aborted);
                let outcome = RunOutcome {
                    status: RunStatus::Aborted,
                    row_count: 0,
                    production_table: production,
                    ingestion_timestamp,
                    reason: Some(AbortReason {
                        kind: e.kind(),
                        message: e.to_string(),
                        state: failed_in,
                    }),
                };
                error!("{}", outcome);
                outcome
            }
        }
    }

    /// Fetch and reshape without touching any table.
    pub async fn preview(
        &self,
        ingestion_timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Row>, RefreshError> {
        self.spec.validate()?;
        let datasets = self.fetch_all(cancel).await?;
        assemble_rows(&datasets, ingestion_timestamp)
    }

    async fn execute(
        &self,
        ingestion_timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
        state: &mut RunState,
    ) -> Result<usize, RefreshError> {
        self.spec.validate()?;
        let production = self.spec.destination.production();
        let staging = self.spec.destination.staging();

        let datasets = self.fetch_all(cancel).await?;

        advance(state, RunState::Reshaping);
        let rows = assemble_rows(&datasets, ingestion_timestamp)?;
        drop(datasets);
        info!("Assembled {} rows", rows.len());
        ensure_live(cancel)?;

        StagingArea::new(self.store.as_ref())
            .prepare(production, &staging)
            .await?;
        advance(state, RunState::StagingReady);
        ensure_live(cancel)?;

        let mut channel = StreamingLoader::new(self.ingest.as_ref())
            .open(&staging)
            .await?;
        advance(state, RunState::Streaming);
        let committed = self.stream_and_wait(&mut channel, &rows, cancel, state).await;

        match (channel.close().await, &committed) {
            (Ok(()), _) => {}
            (Err(e), Ok(_)) => warn!(error = %e, "Channel close failed after commit, continuing"),
            (Err(e), Err(_)) => warn!(error = %e, "Channel close failed while aborting"),
        }
        let receipt = committed?;

        SwapCoordinator::new(self.store.as_ref())
            .swap(production, &staging, receipt)
            .await?;
        advance(state, RunState::Swapped);
        Ok(rows.len())
    }

    async fn fetch_all(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<IndicatorDataset>, RefreshError> {
        let catalog = self.catalog.clone();
        let dataset = self.spec.catalog.dataset.clone();
        let concurrency = self.spec.catalog.max_concurrent_fetches;

        let fetch = async move {
            let codes = catalog.list_indicators(&dataset).await?;
            info!("Found {} {} indicators", codes.len(), dataset);
            // `buffered` keeps results in code order regardless of completion order
            futures::stream::iter(codes)
                .map(|code| {
                    let catalog = catalog.clone();
                    async move {
                        let data = catalog.fetch_indicator(&code).await?;
                        debug!("Fetched indicator {}", code);
                        Ok::<_, RefreshError>(data)
                    }
                })
                .buffered(concurrency)
                .try_collect::<Vec<_>>()
                .await
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(RefreshError::Cancelled),
            result = fetch => result,
        }
    }

    async fn stream_and_wait(
        &self,
        channel: &mut LoaderChannel,
        rows: &[Row],
        cancel: &CancellationToken,
        state: &mut RunState,
    ) -> Result<CommitReceipt, RefreshError> {
        info!("Inserting {} rows into {}...", rows.len(), channel.table());
        let mut token = AppendToken::FIRST;
        for (i, row) in rows.iter().enumerate() {
            if i % CANCEL_CHECK_EVERY == 0 {
                ensure_live(cancel)?;
            }
            channel.append(row, token).await?;
            token = token.next();
        }

        info!("All rows appended, waiting for commit...");
        advance(state, RunState::AwaitingCommit);
        CommitWatcher::from_spec(&self.spec.commit)
            .wait_for_commit(channel, AppendToken::last_for(rows.len()), cancel)
            .await
    }
}

/// Reshape every dataset and fix the row order tokens will follow.
pub fn assemble_rows(
    datasets: &[IndicatorDataset],
    ingestion_timestamp: DateTime<Utc>,
) -> Result<Vec<Row>, RefreshError> {
    let mut rows = Vec::new();
    for dataset in datasets {
        rows.extend(reshape(dataset, ingestion_timestamp)?);
    }
    // stable: equal keys from different fetches keep fetch order
    rows.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    Ok(rows)
}

fn advance(state: &mut RunState, next: RunState) {
    debug!("{:?} -> {:?}", state, next);
    *state = next;
}

fn ensure_live(cancel: &CancellationToken) -> Result<(), RefreshError> {
    if cancel.is_cancelled() {
        Err(RefreshError::Cancelled)
    } else {
        Ok(())
    }
}

//! # IMF Core - staged refresh pipeline
//!
//! This crate provides the types, collaborator traits and the pipeline engine
//! that fully replaces a destination table with freshly fetched indicator data
//! without readers ever seeing a partial dataset.
//!
//! ## Key Components
//!
//! - **Row Source Adapter** ([`reshape`]): nested entity → period → value JSON into flat [`Row`]s
//! - **Staging Area Manager** ([`staging`]): create-like and truncate the staging table
//! - **Streaming Loader** ([`loader`]): ordered, tokenized appends over an ingest channel
//! - **Commit Watcher** ([`watcher`]): bounded fixed-interval wait for the final acknowledgement
//! - **Swap Coordinator** ([`swap`]): the single atomic visibility boundary
//! - **Pipeline Orchestrator** ([`pipeline`]): sequencing and the abort policy
//!
//! The catalog and the destination store are external collaborators, reached
//! only through the [`CatalogSource`], [`TableStore`] and [`StreamingIngest`]
//! traits defined here. Concrete implementations live in `imf-io`.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use imf_core::{RefreshPipeline, RefreshSpec};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(catalog: std::sync::Arc<dyn imf_core::CatalogSource>,
//! #                  store: std::sync::Arc<dyn imf_core::TableStore>,
//! #                  ingest: std::sync::Arc<dyn imf_core::StreamingIngest>) {
//! let spec = RefreshSpec::load(None).unwrap();
//! let pipeline = RefreshPipeline::new(spec, catalog, store, ingest);
//! let outcome = pipeline.run(CancellationToken::new()).await;
//! println!("{outcome}");
//! # }
//! ```

use async_trait::async_trait;

pub mod config;
pub mod error;
pub mod loader;
pub mod model;
pub mod pipeline;
pub mod reshape;
pub mod staging;
pub mod swap;
pub mod watcher;

pub use config::{CatalogSpec, CommitSpec, DestinationSpec, RefreshSpec, StoreSpec};
pub use error::{ErrorKind, RefreshError, StoreError};
pub use model::{AppendToken, IndicatorCode, IndicatorDataset, Row};
pub use pipeline::{RefreshPipeline, RunOutcome, RunState, RunStatus};

/// Remote indicator catalog.
///
/// Both calls are single requests with a fixed timeout; failures surface as
/// [`RefreshError::SourceFetch`].
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Codes of all indicators tagged with `dataset`, in ascending order
    async fn list_indicators(&self, dataset: &str) -> Result<Vec<IndicatorCode>, RefreshError>;

    /// Raw values payload of one indicator
    async fn fetch_indicator(&self, code: &str) -> Result<IndicatorDataset, RefreshError>;
}

/// DDL boundary of the destination store.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Create `name` with the canonical row schema if it does not exist.
    async fn ensure_table(&self, name: &str) -> Result<(), StoreError>;

    /// Create `new_name` with `template`'s shape. No-op if `new_name` exists.
    async fn create_table_like(&self, new_name: &str, template: &str) -> Result<(), StoreError>;

    /// Remove every row of `name`.
    async fn truncate(&self, name: &str) -> Result<(), StoreError>;

    /// Exchange the identities of two tables in one indivisible step.
    async fn swap(&self, a: &str, b: &str) -> Result<(), StoreError>;
}

/// Streaming append boundary of the destination store.
#[async_trait]
pub trait StreamingIngest: Send + Sync {
    async fn open_channel(&self, table: &str) -> Result<Box<dyn IngestChannel>, StoreError>;
}

/// One logical append channel bound to a table.
///
/// The sink commits appended rows asynchronously; `append_row` must not wait
/// for that commit.
#[async_trait]
pub trait IngestChannel: Send + Sync {
    async fn append_row(&mut self, row: &Row, token: AppendToken) -> Result<(), StoreError>;

    /// Highest token whose row (and every row before it) is durably committed
    async fn latest_committed_token(&self) -> Result<Option<AppendToken>, StoreError>;

    async fn close(self: Box<Self>) -> Result<(), StoreError>;
}

//! # IMF I/O - Catalog Source and Table Store Implementations
//!
//! Concrete collaborators for the `imf-core` refresh pipeline.
//!
//! ### Source
//! - **HTTP catalog**: IMF DataMapper `indicators` listing and per-indicator values
//!
//! ### Stores
//! - **Parquet directory**: local lakehouse tables, manifest-rename atomic swap
//! - **Memory**: in-process tables with fault injection, for dry runs and tests
//! - **Stdout preview**: prints the head of a row set without loading it
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use imf_core::RefreshSpec;
//! use imf_io::{open_destination, source_catalog::HttpCatalog};
//!
//! let spec = RefreshSpec::default();
//! let catalog = HttpCatalog::new(&spec.catalog).unwrap();
//! let destination = open_destination(&spec.store).unwrap();
//! ```

use imf_core::{StoreSpec, StreamingIngest, TableStore};
use std::sync::Arc;
use std::time::Duration;

/// Rows <-> Arrow record batches
pub mod arrow_rows;

/// Standard output preview for dry runs
pub mod sink_stdout;

/// IMF DataMapper HTTP catalog
pub mod source_catalog;

/// In-memory table store
pub mod store_memory;

/// Parquet directory table store
pub mod store_parquet;

/// The two store boundaries of one configured destination.
pub struct Destination {
    pub tables: Arc<dyn TableStore>,
    pub ingest: Arc<dyn StreamingIngest>,
}

pub fn open_destination(spec: &StoreSpec) -> anyhow::Result<Destination> {
    match spec {
        StoreSpec::Memory { ack_delay_ms } => {
            let store = Arc::new(
                store_memory::MemoryStore::new().with_ack_delay(Duration::from_millis(*ack_delay_ms)),
            );
            Ok(Destination {
                tables: store.clone(),
                ingest: store,
            })
        }
        StoreSpec::ParquetDir {
            path,
            flush_rows,
            flush_interval_ms,
        } => {
            let store = Arc::new(store_parquet::ParquetDirStore::open(
                path,
                *flush_rows,
                Duration::from_millis(*flush_interval_ms),
            )?);
            Ok(Destination {
                tables: store.clone(),
                ingest: store,
            })
        }
    }
}

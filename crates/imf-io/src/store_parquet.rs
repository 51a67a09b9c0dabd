//! Local Parquet lakehouse store.
//!
//! Layout under the root directory:
//!
//! ```text
//! _tables.json                          table name -> list of segment files
//! data/<uuid>.parquet                   immutable row segments
//! ```
//!
//! A table's contents are exactly the segments its manifest entry lists.
//! Every DDL change writes a new manifest next to the old one and renames it
//! into place, so a swap is one atomic `rename(2)`: readers that load the
//! manifest see the tables either before or after it.
//!
//! Each table entry carries a generation that changes whenever the entry is
//! created or truncated. A channel only records segments into the generation
//! it was opened on, so a writer outliving a truncate cannot leak rows into
//! the next load. Segments and the manifest are fsynced, together with their
//! directories, before a token is acknowledged.

use anyhow::Context;
use async_trait::async_trait;
use imf_core::{AppendToken, IngestChannel, Row, StoreError, StreamingIngest, TableStore};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::arrow_rows::{batch_to_rows, row_schema, rows_to_batch};

const MANIFEST_FILE: &str = "_tables.json";
const DATA_DIR: &str = "data";
const CHANNEL_CAPACITY: usize = 4096;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Manifest {
    #[serde(default)]
    tables: BTreeMap<String, TableEntry>,
    /// Last generation handed out to any table entry
    #[serde(default)]
    last_generation: u64,
}

impl Manifest {
    fn next_generation(&mut self) -> u64 {
        self.last_generation += 1;
        self.last_generation
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct TableEntry {
    /// Column names, checked against the row schema on `create_table_like`
    columns: Vec<String>,
    /// Segment paths relative to the store root
    segments: Vec<String>,
    #[serde(default)]
    generation: u64,
}

impl TableEntry {
    fn canonical(generation: u64) -> Self {
        Self {
            columns: row_schema()
                .fields()
                .iter()
                .map(|f| f.name().to_string())
                .collect(),
            segments: Vec::new(),
            generation,
        }
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

struct Inner {
    root: PathBuf,
    /// Serializes manifest read-modify-write cycles within this process
    manifest_lock: Mutex<()>,
}

impl Inner {
    fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    fn load_manifest(&self) -> Result<Manifest, StoreError> {
        let path = self.manifest_path();
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("decode {}", path.display()))
                .map_err(StoreError::Other),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Manifest::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write-temp-then-rename; the rename is the commit point.
    fn write_manifest(&self, manifest: &Manifest) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(manifest).map_err(|e| StoreError::Other(e.into()))?;
        let tmp = self
            .root
            .join(format!(".{}.{}.tmp", MANIFEST_FILE, Uuid::new_v4()));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.manifest_path())?;
        sync_dir(&self.root)?;
        Ok(())
    }

    /// Apply `change` to the manifest under the lock and persist it.
    async fn update<T>(
        &self,
        change: impl FnOnce(&mut Manifest) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _guard = self.manifest_lock.lock().await;
        let mut manifest = self.load_manifest()?;
        let result = change(&mut manifest)?;
        self.write_manifest(&manifest)?;
        Ok(result)
    }

    /// Write `rows` as a new durable segment file and return its relative path.
    fn write_segment(&self, rows: &[Row]) -> Result<String, StoreError> {
        let batch = rows_to_batch(rows).map_err(|e| StoreError::Other(e.into()))?;
        let relative = format!("{}/{}.parquet", DATA_DIR, Uuid::new_v4());
        let file = fs::File::create(self.root.join(&relative))?;
        let props = WriterProperties::builder().build();
        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))
            .map_err(|e| StoreError::Other(e.into()))?;
        writer.write(&batch).map_err(|e| StoreError::Other(e.into()))?;
        let file = writer
            .into_inner()
            .map_err(|e| StoreError::Other(e.into()))?;
        file.sync_all()?;
        sync_dir(&self.root.join(DATA_DIR))?;
        Ok(relative)
    }

    fn read_segment(&self, relative: &str) -> Result<Vec<Row>, StoreError> {
        let file = fs::File::open(self.root.join(relative))?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .and_then(|b| b.build())
            .map_err(|e| StoreError::Other(e.into()))?;
        let mut rows = Vec::new();
        for batch in reader {
            let batch = batch.map_err(|e| StoreError::Other(e.into()))?;
            rows.extend(batch_to_rows(&batch)?);
        }
        Ok(rows)
    }

    fn remove_segments(&self, segments: &[String]) {
        for segment in segments {
            if let Err(e) = fs::remove_file(self.root.join(segment)) {
                warn!(error = %e, "could not remove segment {}", segment);
            }
        }
    }
}

/// Parquet-backed [`TableStore`] and [`StreamingIngest`].
#[derive(Clone)]
pub struct ParquetDirStore {
    inner: Arc<Inner>,
    flush_rows: usize,
    flush_interval: Duration,
}

impl ParquetDirStore {
    pub fn open(
        root: impl AsRef<Path>,
        flush_rows: usize,
        flush_interval: Duration,
    ) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(DATA_DIR))?;
        info!("Parquet store at {}", root.display());
        Ok(Self {
            inner: Arc::new(Inner {
                root,
                manifest_lock: Mutex::new(()),
            }),
            flush_rows: flush_rows.max(1),
            flush_interval,
        })
    }

    pub fn table_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.inner.load_manifest()?.tables.into_keys().collect())
    }

    /// Read every row of `table` as of one manifest snapshot.
    pub fn read_table(&self, table: &str) -> Result<Vec<Row>, StoreError> {
        let manifest = self.inner.load_manifest()?;
        let entry = manifest
            .tables
            .get(table)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        let mut rows = Vec::new();
        for segment in &entry.segments {
            rows.extend(self.inner.read_segment(segment)?);
        }
        Ok(rows)
    }
}

#[async_trait]
impl TableStore for ParquetDirStore {
    async fn ensure_table(&self, name: &str) -> Result<(), StoreError> {
        self.inner
            .update(|m| {
                if !m.tables.contains_key(name) {
                    info!("Creating table {}", name);
                    let generation = m.next_generation();
                    m.tables.insert(name.to_string(), TableEntry::canonical(generation));
                }
                Ok(())
            })
            .await
    }

    async fn create_table_like(&self, new_name: &str, template: &str) -> Result<(), StoreError> {
        self.inner
            .update(|m| {
                let columns = m
                    .tables
                    .get(template)
                    .ok_or_else(|| StoreError::TableNotFound(template.to_string()))?
                    .columns
                    .clone();
                if !m.tables.contains_key(new_name) {
                    let generation = m.next_generation();
                    m.tables.insert(
                        new_name.to_string(),
                        TableEntry {
                            columns,
                            segments: Vec::new(),
                            generation,
                        },
                    );
                }
                Ok(())
            })
            .await
    }

    async fn truncate(&self, name: &str) -> Result<(), StoreError> {
        let dropped = self
            .inner
            .update(|m| {
                let generation = m.next_generation();
                let entry = m
                    .tables
                    .get_mut(name)
                    .ok_or_else(|| StoreError::TableNotFound(name.to_string()))?;
                entry.generation = generation;
                Ok(std::mem::take(&mut entry.segments))
            })
            .await?;
        // unreferenced once the manifest is committed
        self.inner.remove_segments(&dropped);
        debug!("Truncated {} ({} segments removed)", name, dropped.len());
        Ok(())
    }

    async fn swap(&self, a: &str, b: &str) -> Result<(), StoreError> {
        self.inner
            .update(|m| {
                let entry_a = m
                    .tables
                    .remove(a)
                    .ok_or_else(|| StoreError::TableNotFound(a.to_string()))?;
                let Some(entry_b) = m.tables.remove(b) else {
                    return Err(StoreError::TableNotFound(b.to_string()));
                };
                m.tables.insert(a.to_string(), entry_b);
                m.tables.insert(b.to_string(), entry_a);
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl StreamingIngest for ParquetDirStore {
    async fn open_channel(&self, table: &str) -> Result<Box<dyn IngestChannel>, StoreError> {
        let generation = self
            .inner
            .load_manifest()?
            .tables
            .get(table)
            .map(|entry| entry.generation)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (ack_tx, ack_rx) = watch::channel(None);
        let failure = Arc::new(StdMutex::new(None));
        let writer = SegmentWriter {
            inner: self.inner.clone(),
            table: table.to_string(),
            generation,
            flush_rows: self.flush_rows,
            flush_interval: self.flush_interval,
            failure: failure.clone(),
        };
        let task = tokio::spawn(writer.run(rx, ack_tx));
        Ok(Box::new(ParquetChannel {
            tx,
            acknowledged: ack_rx,
            failure,
            task,
        }))
    }
}

struct ParquetChannel {
    tx: mpsc::Sender<(Row, AppendToken)>,
    acknowledged: watch::Receiver<Option<AppendToken>>,
    failure: Arc<StdMutex<Option<String>>>,
    task: JoinHandle<Result<(), StoreError>>,
}

impl ParquetChannel {
    fn check_failure(&self) -> Result<(), StoreError> {
        let failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        match failure.as_ref() {
            Some(message) => Err(StoreError::Rejected(format!("segment writer failed: {message}"))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl IngestChannel for ParquetChannel {
    async fn append_row(&mut self, row: &Row, token: AppendToken) -> Result<(), StoreError> {
        self.check_failure()?;
        self.tx
            .send((row.clone(), token))
            .await
            .map_err(|_| StoreError::ChannelClosed("segment writer stopped"))
    }

    async fn latest_committed_token(&self) -> Result<Option<AppendToken>, StoreError> {
        self.check_failure()?;
        Ok(*self.acknowledged.borrow())
    }

    async fn close(self: Box<Self>) -> Result<(), StoreError> {
        let ParquetChannel { tx, task, .. } = *self;
        drop(tx);
        task.await
            .map_err(|e| StoreError::Other(anyhow::Error::new(e)))?
    }
}

/// Background task turning appended rows into committed segments.
struct SegmentWriter {
    inner: Arc<Inner>,
    table: String,
    /// Generation of the table entry at open time
    generation: u64,
    flush_rows: usize,
    flush_interval: Duration,
    failure: Arc<StdMutex<Option<String>>>,
}

impl SegmentWriter {
    async fn run(
        self,
        mut rx: mpsc::Receiver<(Row, AppendToken)>,
        ack: watch::Sender<Option<AppendToken>>,
    ) -> Result<(), StoreError> {
        let result = self.pump(&mut rx, &ack).await;
        if let Err(e) = &result {
            warn!(error = %e, "Segment writer for {} failed", self.table);
            *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(e.to_string());
        }
        result
    }

    async fn pump(
        &self,
        rx: &mut mpsc::Receiver<(Row, AppendToken)>,
        ack: &watch::Sender<Option<AppendToken>>,
    ) -> Result<(), StoreError> {
        let mut buffer: Vec<Row> = Vec::with_capacity(self.flush_rows.min(65536));
        let mut last = None;
        let mut ticker = tokio::time::interval(self.flush_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some((row, token)) => {
                        buffer.push(row);
                        last = Some(token);
                        if buffer.len() >= self.flush_rows {
                            self.flush(&mut buffer, last, ack).await?;
                        }
                    }
                    None => {
                        self.flush(&mut buffer, last, ack).await?;
                        return Ok(());
                    }
                },
                _ = ticker.tick() => {
                    self.flush(&mut buffer, last, ack).await?;
                }
            }
        }
    }

    /// Write the buffer as one segment, record it, then acknowledge `last`.
    ///
    /// If the table was truncated or replaced since the channel opened, the
    /// segment is deleted and nothing is acknowledged.
    async fn flush(
        &self,
        buffer: &mut Vec<Row>,
        last: Option<AppendToken>,
        ack: &watch::Sender<Option<AppendToken>>,
    ) -> Result<(), StoreError> {
        if buffer.is_empty() {
            return Ok(());
        }
        let segment = self.inner.write_segment(buffer)?;
        let table = self.table.as_str();
        let generation = self.generation;
        let recorded = segment.clone();
        let current = self
            .inner
            .update(move |m| {
                let entry = m
                    .tables
                    .get_mut(table)
                    .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
                if entry.generation == generation {
                    entry.segments.push(recorded);
                    Ok(true)
                } else {
                    Ok(false)
                }
            })
            .await?;
        if !current {
            warn!(
                "Discarding {} rows for {}: table changed since the channel opened",
                buffer.len(),
                self.table
            );
            self.inner.remove_segments(std::slice::from_ref(&segment));
            buffer.clear();
            return Ok(());
        }
        debug!("Committed {} rows to {} as {}", buffer.len(), self.table, segment);
        buffer.clear();
        ack.send_replace(last);
        Ok(())
    }
}

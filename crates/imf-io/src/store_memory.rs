//! In-process table store with asynchronous ingest.
//!
//! All tables live behind one lock, so [`TableStore::swap`] is a single
//! critical section: a concurrent reader sees either side of it. Appended
//! rows travel over a bounded channel to a committer task which lands them in
//! the table in small batches and only then publishes the acknowledged token.
//! A committer only writes into the table generation it was opened on; rows
//! arriving after a truncate or swap of that table are dropped.
//!
//! The store also records what happened on its channels and accepts injected
//! faults, which makes it the test double for the refresh pipeline.

use async_trait::async_trait;
use imf_core::{AppendToken, IngestChannel, Row, StoreError, StreamingIngest, TableStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CHANNEL_CAPACITY: usize = 1024;
const COMMIT_BATCH: usize = 256;

/// Failures the store injects on request.
#[derive(Debug, Clone, Default)]
pub struct MemoryFaults {
    /// Accept appends but never commit or acknowledge them
    pub stall_acknowledgements: bool,
    pub fail_open: bool,
    pub fail_truncate: bool,
    pub fail_swap: bool,
    /// Fail every `latest_committed_token` query
    pub fail_poll: bool,
    /// Reject the append carrying this token
    pub reject_token: Option<u64>,
}

/// What one opened channel saw.
#[derive(Debug, Clone, Default)]
pub struct ChannelRecord {
    pub table: String,
    pub tokens: Vec<u64>,
    pub polls: usize,
    pub acknowledged: Option<AppendToken>,
    pub closed: bool,
}

/// A completed swap and the acknowledgement state of the newest channel at that moment.
#[derive(Debug, Clone)]
pub struct SwapRecord {
    pub a: String,
    pub b: String,
    pub latest_channel_acknowledged: Option<AppendToken>,
    pub latest_channel_appended: usize,
}

#[derive(Debug, Default)]
struct MemTable {
    rows: Vec<Row>,
    generation: u64,
}

// Every critical section below leaves the maps consistent, so a poisoned
// lock is recovered rather than propagated.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Shared {
    tables: RwLock<HashMap<String, MemTable>>,
    last_generation: AtomicU64,
    faults: Mutex<MemoryFaults>,
    channels: Mutex<Vec<ChannelRecord>>,
    swaps: Mutex<Vec<SwapRecord>>,
}

impl Shared {
    fn read_tables(&self) -> RwLockReadGuard<'_, HashMap<String, MemTable>> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_tables(&self) -> RwLockWriteGuard<'_, HashMap<String, MemTable>> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_generation(&self) -> u64 {
        self.last_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn fresh_table(&self, rows: Vec<Row>) -> MemTable {
        MemTable {
            rows,
            generation: self.next_generation(),
        }
    }

    fn faults(&self) -> MemoryFaults {
        lock(&self.faults).clone()
    }

    fn record<F: FnOnce(&mut ChannelRecord)>(&self, index: usize, update: F) {
        if let Some(record) = lock(&self.channels).get_mut(index) {
            update(record);
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    ack_delay: Duration,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay applied before each committed batch is acknowledged.
    pub fn with_ack_delay(mut self, ack_delay: Duration) -> Self {
        self.ack_delay = ack_delay;
        self
    }

    pub fn set_faults(&self, faults: MemoryFaults) {
        *lock(&self.shared.faults) = faults;
    }

    /// Replace the contents of `table`, creating it if needed.
    pub fn load_table(&self, table: &str, rows: Vec<Row>) {
        let fresh = self.shared.fresh_table(rows);
        self.shared.write_tables().insert(table.to_string(), fresh);
    }

    /// Snapshot of a table's rows, `None` if the table does not exist.
    pub fn rows(&self, table: &str) -> Option<Vec<Row>> {
        self.shared.read_tables().get(table).map(|t| t.rows.clone())
    }

    pub fn row_count(&self, table: &str) -> Option<usize> {
        self.shared.read_tables().get(table).map(|t| t.rows.len())
    }

    pub fn table_exists(&self, table: &str) -> bool {
        self.shared.read_tables().contains_key(table)
    }

    pub fn channel_records(&self) -> Vec<ChannelRecord> {
        lock(&self.shared.channels).clone()
    }

    /// Channels opened and not yet closed.
    pub fn open_channel_count(&self) -> usize {
        lock(&self.shared.channels).iter().filter(|r| !r.closed).count()
    }

    pub fn swap_records(&self) -> Vec<SwapRecord> {
        lock(&self.shared.swaps).clone()
    }
}

#[async_trait]
impl TableStore for MemoryStore {
    async fn ensure_table(&self, name: &str) -> Result<(), StoreError> {
        let mut tables = self.shared.write_tables();
        if !tables.contains_key(name) {
            info!("Creating table {}", name);
            tables.insert(name.to_string(), self.shared.fresh_table(Vec::new()));
        }
        Ok(())
    }

    async fn create_table_like(&self, new_name: &str, template: &str) -> Result<(), StoreError> {
        let mut tables = self.shared.write_tables();
        if !tables.contains_key(template) {
            return Err(StoreError::TableNotFound(template.to_string()));
        }
        // every table shares the row schema, so "like" only needs the template to exist
        if !tables.contains_key(new_name) {
            tables.insert(new_name.to_string(), self.shared.fresh_table(Vec::new()));
        }
        Ok(())
    }

    async fn truncate(&self, name: &str) -> Result<(), StoreError> {
        if self.shared.faults().fail_truncate {
            return Err(StoreError::Rejected(format!("truncate of {name} refused")));
        }
        let mut tables = self.shared.write_tables();
        let table = tables
            .get_mut(name)
            .ok_or_else(|| StoreError::TableNotFound(name.to_string()))?;
        table.rows.clear();
        table.generation = self.shared.next_generation();
        Ok(())
    }

    async fn swap(&self, a: &str, b: &str) -> Result<(), StoreError> {
        if self.shared.faults().fail_swap {
            return Err(StoreError::Rejected(format!("swap of {a} and {b} refused")));
        }
        let mut tables = self.shared.write_tables();
        let table_a = tables
            .remove(a)
            .ok_or_else(|| StoreError::TableNotFound(a.to_string()))?;
        let Some(table_b) = tables.remove(b) else {
            tables.insert(a.to_string(), table_a);
            return Err(StoreError::TableNotFound(b.to_string()));
        };
        tables.insert(a.to_string(), table_b);
        tables.insert(b.to_string(), table_a);

        let latest = lock(&self.shared.channels).last().cloned().unwrap_or_default();
        lock(&self.shared.swaps).push(SwapRecord {
            a: a.to_string(),
            b: b.to_string(),
            latest_channel_acknowledged: latest.acknowledged,
            latest_channel_appended: latest.tokens.len(),
        });
        Ok(())
    }
}

#[async_trait]
impl StreamingIngest for MemoryStore {
    async fn open_channel(&self, table: &str) -> Result<Box<dyn IngestChannel>, StoreError> {
        let faults = self.shared.faults();
        if faults.fail_open {
            return Err(StoreError::Rejected(format!("channel on {table} refused")));
        }
        let generation = self
            .shared
            .read_tables()
            .get(table)
            .map(|t| t.generation)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;

        let index = {
            let mut channels = lock(&self.shared.channels);
            channels.push(ChannelRecord {
                table: table.to_string(),
                ..ChannelRecord::default()
            });
            channels.len() - 1
        };
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (ack_tx, ack_rx) = watch::channel(None);
        let committer = Committer {
            shared: self.shared.clone(),
            table: table.to_string(),
            generation,
            index,
            ack_delay: self.ack_delay,
            stalled: faults.stall_acknowledgements,
        };
        let task = tokio::spawn(committer.run(rx, ack_tx));

        Ok(Box::new(MemoryChannel {
            shared: self.shared.clone(),
            index,
            tx,
            acknowledged: ack_rx,
            task,
            reject_token: faults.reject_token,
        }))
    }
}

struct MemoryChannel {
    shared: Arc<Shared>,
    index: usize,
    tx: mpsc::Sender<(Row, AppendToken)>,
    acknowledged: watch::Receiver<Option<AppendToken>>,
    task: JoinHandle<()>,
    reject_token: Option<u64>,
}

#[async_trait]
impl IngestChannel for MemoryChannel {
    async fn append_row(&mut self, row: &Row, token: AppendToken) -> Result<(), StoreError> {
        if self.reject_token == Some(token.value()) {
            return Err(StoreError::Rejected(format!("row {token} rejected")));
        }
        self.tx
            .send((row.clone(), token))
            .await
            .map_err(|_| StoreError::ChannelClosed("committer stopped"))?;
        self.shared.record(self.index, |r| r.tokens.push(token.value()));
        Ok(())
    }

    async fn latest_committed_token(&self) -> Result<Option<AppendToken>, StoreError> {
        self.shared.record(self.index, |r| r.polls += 1);
        if self.shared.faults().fail_poll {
            return Err(StoreError::Rejected("offset query refused".into()));
        }
        Ok(*self.acknowledged.borrow())
    }

    async fn close(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryChannel {
            shared,
            index,
            tx,
            task,
            ..
        } = *self;
        drop(tx);
        let joined = task.await;
        shared.record(index, |r| r.closed = true);
        joined.map_err(|e| StoreError::Other(anyhow::Error::new(e)))
    }
}

struct Committer {
    shared: Arc<Shared>,
    table: String,
    generation: u64,
    index: usize,
    ack_delay: Duration,
    stalled: bool,
}

impl Committer {
    async fn run(
        self,
        mut rx: mpsc::Receiver<(Row, AppendToken)>,
        ack: watch::Sender<Option<AppendToken>>,
    ) {
        let mut batch = Vec::with_capacity(COMMIT_BATCH);
        while let Some(first) = rx.recv().await {
            batch.push(first);
            while batch.len() < COMMIT_BATCH {
                match rx.try_recv() {
                    Ok(next) => batch.push(next),
                    Err(_) => break,
                }
            }
            if self.stalled {
                batch.clear();
                continue;
            }
            if !self.ack_delay.is_zero() {
                tokio::time::sleep(self.ack_delay).await;
            }

            let last = batch.last().map(|(_, token)| *token);
            {
                let mut tables = self.shared.write_tables();
                match tables.get_mut(&self.table) {
                    Some(table) if table.generation == self.generation => {
                        table.rows.extend(batch.drain(..).map(|(row, _)| row));
                    }
                    Some(_) => {
                        warn!(
                            "Discarding {} rows for {}: table changed since the channel opened",
                            batch.len(),
                            self.table
                        );
                        batch.clear();
                        continue;
                    }
                    None => {
                        warn!("Table {} vanished, committer stopping", self.table);
                        return;
                    }
                }
            }
            self.shared.record(self.index, |r| r.acknowledged = last);
            ack.send_replace(last);
            debug!("Committed through token {:?} on {}", last, self.table);
        }
    }
}

//! In-memory remote service for tests.

use crate::remote::{Credential, RemoteError, RemoteResult, RemoteService};
use crate::state::CancelToken;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tidesync_protocol::{Page, PageRequest, Record, RecordId, Version, Watermark};

/// Server-side tables.
///
/// Every write bumps the record's version (`v1`, `v2`, ...) and stamps it
/// with the next tick of a logical clock. Deletes are soft: the record stays
/// as a tombstone so incremental pulls can see it.
#[derive(Debug)]
struct Tables {
    records: BTreeMap<(String, RecordId), (Record, u64)>,
    clock: i64,
}

impl Tables {
    fn tick(&mut self) -> Watermark {
        self.clock += 1;
        Watermark(self.clock)
    }

    fn live(&self, table: &str, id: &RecordId) -> Option<&Record> {
        self.records
            .get(&(table.to_string(), id.clone()))
            .map(|(record, _)| record)
            .filter(|record| !record.deleted)
    }

    fn write(&mut self, mut record: Record) -> Record {
        let at = self.tick();
        let key = (record.table.clone(), record.id.clone());
        let revision = self.records.get(&key).map_or(0, |(_, n)| *n) + 1;
        record.version = Some(Version::new(format!("v{revision}")));
        record.updated_at = Some(at);
        self.records.insert(key, (record.clone(), revision));
        record
    }
}

/// Work done when a chosen call arrives, before it is served.
#[derive(Debug)]
enum Scheduled {
    Put {
        table: String,
        id: RecordId,
        payload: Value,
    },
    Cancel(CancelToken),
}

/// A remote service holding its tables in memory.
///
/// Writes are conditional like a real backend's. Tests can require a token,
/// add latency, fail chosen calls and inspect call counters.
#[derive(Debug)]
pub struct MemoryRemote {
    tables: Mutex<Tables>,
    required_token: Mutex<Option<String>>,
    failures: Mutex<HashMap<u64, RemoteError>>,
    scheduled: Mutex<HashMap<u64, Vec<Scheduled>>>,
    latency: Mutex<Duration>,
    calls: AtomicU64,
    writes: AtomicU64,
    queries: AtomicU64,
}

impl MemoryRemote {
    /// Creates an empty remote whose clock starts at 1000.
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables {
                records: BTreeMap::new(),
                clock: 1000,
            }),
            required_token: Mutex::new(None),
            failures: Mutex::new(HashMap::new()),
            scheduled: Mutex::new(HashMap::new()),
            latency: Mutex::new(Duration::ZERO),
            calls: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            queries: AtomicU64::new(0),
        }
    }

    /// Rejects calls whose credential is not `token`.
    pub fn require_token(&self, token: impl Into<String>) {
        *self.required_token.lock() = Some(token.into());
    }

    /// Delays every call.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Makes the `n`-th call (1-based, counting every call) fail.
    pub fn fail_call(&self, n: u64, error: RemoteError) {
        self.failures.lock().insert(n, error);
    }

    /// Makes the next call fail.
    pub fn fail_next(&self, error: RemoteError) {
        self.fail_call(self.calls() + 1, error);
    }

    /// Has another client write a record just before the `n`-th call is
    /// served.
    pub fn put_on_call(&self, n: u64, table: &str, id: impl Into<RecordId>, payload: Value) {
        self.scheduled.lock().entry(n).or_default().push(Scheduled::Put {
            table: table.to_string(),
            id: id.into(),
            payload,
        });
    }

    /// Cancels `token` while the `n`-th call is served. The call itself
    /// still completes.
    pub fn cancel_on_call(&self, n: u64, token: &CancelToken) {
        self.scheduled
            .lock()
            .entry(n)
            .or_default()
            .push(Scheduled::Cancel(token.clone()));
    }

    /// Stores a record as another client would, stamping version and
    /// watermark.
    pub fn put(&self, table: &str, id: impl Into<RecordId>, payload: Value) -> Record {
        self.tables.lock().write(Record::new(table, id, payload))
    }

    /// Stores a record exactly as given (version and watermark included).
    pub fn seed(&self, record: Record) {
        let mut tables = self.tables.lock();
        if let Some(Watermark(at)) = record.updated_at {
            tables.clock = tables.clock.max(at);
        }
        let key = (record.table.clone(), record.id.clone());
        tables.records.insert(key, (record, 1));
    }

    /// Soft-deletes a record as another client would.
    pub fn remove(&self, table: &str, id: impl Into<RecordId>) -> Option<Record> {
        let mut tables = self.tables.lock();
        let mut record = tables.live(table, &id.into())?.clone();
        record.deleted = true;
        Some(tables.write(record))
    }

    /// Returns a record, tombstones included.
    pub fn record(&self, table: &str, id: impl Into<RecordId>) -> Option<Record> {
        self.tables
            .lock()
            .records
            .get(&(table.to_string(), id.into()))
            .map(|(record, _)| record.clone())
    }

    /// Number of live records in a table.
    pub fn len(&self, table: &str) -> usize {
        self.tables
            .lock()
            .records
            .values()
            .filter(|(r, _)| r.table == table && !r.deleted)
            .count()
    }

    /// Returns true if the table has no live records.
    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    /// Total calls received.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Create, replace and delete calls received.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Query calls received.
    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }

    async fn admit(&self, credential: &Credential) -> RemoteResult<()> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let due = self.scheduled.lock().remove(&n).unwrap_or_default();
        for event in due {
            match event {
                Scheduled::Put { table, id, payload } => {
                    self.tables.lock().write(Record::new(table, id, payload));
                }
                Scheduled::Cancel(token) => token.cancel(),
            }
        }
        if let Some(error) = self.failures.lock().remove(&n) {
            return Err(error);
        }
        match self.required_token.lock().as_deref() {
            Some(token) if token != credential.token() => {
                Err(RemoteError::Unauthenticated("token rejected".into()))
            }
            _ => Ok(()),
        }
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

fn check_version(current: &Record, expected: Option<&Version>) -> RemoteResult<()> {
    match expected {
        Some(expected) if current.version.as_ref() != Some(expected) => {
            Err(RemoteError::conflict(current.clone()))
        }
        _ => Ok(()),
    }
}

#[async_trait]
impl RemoteService for MemoryRemote {
    async fn create(
        &self,
        credential: &Credential,
        table: &str,
        id: &RecordId,
        payload: &Value,
    ) -> RemoteResult<Record> {
        self.admit(credential).await?;
        self.writes.fetch_add(1, Ordering::SeqCst);

        let mut tables = self.tables.lock();
        if let Some((existing, _)) = tables.records.get(&(table.to_string(), id.clone())) {
            return Err(RemoteError::conflict(existing.clone()));
        }
        Ok(tables.write(Record::new(table, id.clone(), payload.clone())))
    }

    async fn replace(
        &self,
        credential: &Credential,
        table: &str,
        id: &RecordId,
        payload: &Value,
        expected: Option<&Version>,
    ) -> RemoteResult<Record> {
        self.admit(credential).await?;
        self.writes.fetch_add(1, Ordering::SeqCst);

        let mut tables = self.tables.lock();
        let current = tables.live(table, id).ok_or(RemoteError::NotFound)?;
        check_version(current, expected)?;

        let mut record = current.clone();
        record.payload = payload.clone();
        Ok(tables.write(record))
    }

    async fn delete(
        &self,
        credential: &Credential,
        table: &str,
        id: &RecordId,
        expected: Option<&Version>,
    ) -> RemoteResult<()> {
        self.admit(credential).await?;
        self.writes.fetch_add(1, Ordering::SeqCst);

        let mut tables = self.tables.lock();
        let current = tables.live(table, id).ok_or(RemoteError::NotFound)?;
        check_version(current, expected)?;

        let mut record = current.clone();
        record.deleted = true;
        tables.write(record);
        Ok(())
    }

    async fn query(&self, credential: &Credential, request: &PageRequest) -> RemoteResult<Page> {
        self.admit(credential).await?;
        self.queries.fetch_add(1, Ordering::SeqCst);

        let tables = self.tables.lock();
        let mut matching: Vec<&Record> = tables
            .records
            .values()
            .map(|(record, _)| record)
            .filter(|record| request.selects(record))
            .collect();
        matching.sort_by(|a, b| (a.updated_at, &a.id).cmp(&(b.updated_at, &b.id)));

        let records: Vec<Record> = matching
            .iter()
            .skip(request.skip)
            .take(request.top)
            .map(|record| (*record).clone())
            .collect();
        let has_more = matching.len() > request.skip + records.len();
        Ok(Page::new(records, has_more))
    }
}

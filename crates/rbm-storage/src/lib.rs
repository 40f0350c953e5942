//! Record Store access + session credential persistence for RBM.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rbm_core::{AvailabilitySlot, Booking, CachedDetail, Channel, DirectoryEntry, ReminderLog, SessionCredential};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rbm-storage";

/// Rows per upsert/insert request.
pub const WRITE_BATCH_SIZE: usize = 50;

#[derive(Debug, Clone)]
pub struct PersistedCredential {
    pub fingerprint: String,
    pub path: PathBuf,
    pub unchanged: bool,
}

/// File-backed upstream session credential shared by all extraction workers.
///
/// Writes are serialized and land through a temp-file rename, so readers never
/// observe a torn credential.
#[derive(Debug)]
pub struct CredentialStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fingerprint(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub async fn load(&self) -> anyhow::Result<Option<SessionCredential>> {
        if !fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking credential path {}", self.path.display()))?
        {
            return Ok(None);
        }
        let bytes = fs::read(&self.path)
            .await
            .with_context(|| format!("reading credential {}", self.path.display()))?;
        let credential = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing credential {}", self.path.display()))?;
        Ok(Some(credential))
    }

    /// Persist a freshly issued credential. Identical content is not rewritten.
    pub async fn persist(&self, credential: &SessionCredential) -> anyhow::Result<PersistedCredential> {
        let _guard = self.write_lock.lock().await;
        let bytes = serde_json::to_vec(credential).context("serializing credential")?;
        let fingerprint = Self::fingerprint(&bytes);

        if let Ok(existing) = fs::read(&self.path).await {
            if Self::fingerprint(&existing) == fingerprint {
                return Ok(PersistedCredential {
                    fingerprint,
                    path: self.path.clone(),
                    unchanged: true,
                });
            }
        }

        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating credential directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp credential file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp credential file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp credential file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp credential {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }

        Ok(PersistedCredential {
            fingerprint,
            path: self.path.clone(),
            unchanged: false,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Bookings,
    AvailabilitySlots,
    ReminderLogs,
    Customers,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Table::Bookings => "bookings",
            Table::AvailabilitySlots => "availability_slots",
            Table::ReminderLogs => "reminder_logs",
            Table::Customers => "customers",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Gte,
    Lt,
    /// `*` matches any run of characters.
    Like,
}

impl FilterOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Gte => "gte",
            FilterOp::Lt => "lt",
            FilterOp::Like => "like",
        }
    }
}

/// One `field <op> value` predicate. Filters passed together are ANDed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: String,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl ToString) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.to_string(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl ToString) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }

    pub fn gte(field: impl Into<String>, value: impl ToString) -> Self {
        Self::new(field, FilterOp::Gte, value)
    }

    pub fn lt(field: impl Into<String>, value: impl ToString) -> Self {
        Self::new(field, FilterOp::Lt, value)
    }

    pub fn like(field: impl Into<String>, pattern: impl ToString) -> Self {
        Self::new(field, FilterOp::Like, pattern)
    }

    pub fn query_value(&self) -> String {
        format!("{}.{}", self.op.as_str(), self.value)
    }

    pub fn matches(&self, row: &JsonValue) -> bool {
        let Some(cell) = row.get(&self.field) else {
            return false;
        };
        let Some(text) = scalar_text(cell) else {
            return false;
        };
        match self.op {
            FilterOp::Eq => text == self.value,
            FilterOp::Gte => compare_cells(cell, &text, &self.value).is_ge(),
            FilterOp::Lt => compare_cells(cell, &text, &self.value).is_lt(),
            FilterOp::Like => like_matches(&self.value, &text),
        }
    }
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn compare_cells(cell: &JsonValue, text: &str, other: &str) -> std::cmp::Ordering {
    if let (JsonValue::Number(n), Ok(rhs)) = (cell, other.parse::<f64>()) {
        if let Some(lhs) = n.as_f64() {
            return lhs.partial_cmp(&rhs).unwrap_or(std::cmp::Ordering::Equal);
        }
    }
    text.cmp(other)
}

fn like_matches(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }
    let (first, last) = (parts[0], parts[parts.len() - 1]);
    let Some(mut rest) = text.strip_prefix(first) else {
        return false;
    };
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("encoding or decoding {table} rows: {source}")]
    Codec {
        table: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("refusing to delete from {0} without a filter")]
    UnfilteredDelete(&'static str),
}

/// CRUD surface of the persistent store the mirror writes into.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, table: Table, filters: &[Filter]) -> Result<Vec<JsonValue>, StoreError>;

    async fn insert(&self, table: Table, rows: &[JsonValue]) -> Result<(), StoreError>;

    /// Insert or update rows keyed by the natural-id columns in `on_conflict`.
    async fn upsert(
        &self,
        table: Table,
        rows: &[JsonValue],
        on_conflict: &[&str],
    ) -> Result<(), StoreError>;

    /// Delete matching rows and return how many went away.
    async fn delete(&self, table: Table, filters: &[Filter]) -> Result<u64, StoreError>;
}

/// PostgREST-dialect client for the hosted Record Store.
#[derive(Debug, Clone)]
pub struct RestRecordStore {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    backoff: BackoffPolicy,
}

impl RestRecordStore {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
        backoff: BackoffPolicy,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            backoff,
        })
    }

    fn table_url(&self, table: Table) -> String {
        format!("{}/rest/v1/{}", self.base_url, table.name())
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("apikey", key).bearer_auth(key),
            None => builder,
        }
    }

    fn filter_pairs(filters: &[Filter]) -> Vec<(String, String)> {
        filters
            .iter()
            .map(|f| (f.field.clone(), f.query_value()))
            .collect()
    }

    async fn send_with_backoff<F>(&self, url: &str, build: F) -> Result<reqwest::Response, StoreError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.authorize(build()).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(StoreError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                        body: body.chars().take(200).collect(),
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries {
                        debug!(attempt, error = %err, "record store request failed, retrying");
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(StoreError::Request(err));
                }
            }
        }

        match last_request_error {
            Some(err) => Err(StoreError::Request(err)),
            None => Err(StoreError::HttpStatus {
                status: 0,
                url: url.to_string(),
                body: "retry budget exhausted".to_string(),
            }),
        }
    }
}

#[async_trait]
impl RecordStore for RestRecordStore {
    async fn get(&self, table: Table, filters: &[Filter]) -> Result<Vec<JsonValue>, StoreError> {
        let url = self.table_url(table);
        let mut query = Self::filter_pairs(filters);
        query.push(("select".to_string(), "*".to_string()));
        let resp = self
            .send_with_backoff(&url, || self.client.get(&url).query(&query))
            .instrument(info_span!("store_get", table = table.name()))
            .await?;
        Ok(resp.json().await?)
    }

    async fn insert(&self, table: Table, rows: &[JsonValue]) -> Result<(), StoreError> {
        let url = self.table_url(table);
        for batch in rows.chunks(WRITE_BATCH_SIZE) {
            self.send_with_backoff(&url, || self.client.post(&url).json(batch))
                .instrument(info_span!("store_insert", table = table.name(), rows = batch.len()))
                .await?;
        }
        Ok(())
    }

    async fn upsert(
        &self,
        table: Table,
        rows: &[JsonValue],
        on_conflict: &[&str],
    ) -> Result<(), StoreError> {
        let url = self.table_url(table);
        let on_conflict = on_conflict.join(",");
        for batch in rows.chunks(WRITE_BATCH_SIZE) {
            self.send_with_backoff(&url, || {
                self.client
                    .post(&url)
                    .query(&[("on_conflict", on_conflict.as_str())])
                    .header("Prefer", "resolution=merge-duplicates")
                    .json(batch)
            })
            .instrument(info_span!("store_upsert", table = table.name(), rows = batch.len()))
            .await?;
        }
        Ok(())
    }

    async fn delete(&self, table: Table, filters: &[Filter]) -> Result<u64, StoreError> {
        if filters.is_empty() {
            return Err(StoreError::UnfilteredDelete(table.name()));
        }
        let url = self.table_url(table);
        let query = Self::filter_pairs(filters);
        let resp = self
            .send_with_backoff(&url, || {
                self.client
                    .delete(&url)
                    .query(&query)
                    .header("Prefer", "return=representation")
            })
            .instrument(info_span!("store_delete", table = table.name()))
            .await?;
        let removed: Vec<JsonValue> = resp.json().await.unwrap_or_default();
        Ok(removed.len() as u64)
    }
}

/// In-process store with the same filter semantics, for tests and offline runs.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    tables: Mutex<HashMap<Table, Vec<JsonValue>>>,
    delete_calls: AtomicUsize,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn rows(&self, table: Table) -> Vec<JsonValue> {
        self.tables.lock().await.get(&table).cloned().unwrap_or_default()
    }

    pub async fn seed(&self, table: Table, rows: Vec<JsonValue>) {
        self.tables.lock().await.entry(table).or_default().extend(rows);
    }

    /// Number of `delete` calls received, whether or not they matched anything.
    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }
}

fn same_key(a: &JsonValue, b: &JsonValue, keys: &[&str]) -> bool {
    keys.iter().all(|k| match (a.get(*k), b.get(*k)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    })
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, table: Table, filters: &[Filter]) -> Result<Vec<JsonValue>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .get(&table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| filters.iter().all(|f| f.matches(row)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert(&self, table: Table, rows: &[JsonValue]) -> Result<(), StoreError> {
        self.tables
            .lock()
            .await
            .entry(table)
            .or_default()
            .extend(rows.iter().cloned());
        Ok(())
    }

    async fn upsert(
        &self,
        table: Table,
        rows: &[JsonValue],
        on_conflict: &[&str],
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let stored = tables.entry(table).or_default();
        for row in rows {
            match stored.iter_mut().find(|existing| same_key(existing, row, on_conflict)) {
                Some(existing) => {
                    if let (Some(target), Some(source)) = (existing.as_object_mut(), row.as_object()) {
                        for (k, v) in source {
                            target.insert(k.clone(), v.clone());
                        }
                    }
                }
                None => stored.push(row.clone()),
            }
        }
        Ok(())
    }

    async fn delete(&self, table: Table, filters: &[Filter]) -> Result<u64, StoreError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if filters.is_empty() {
            return Err(StoreError::UnfilteredDelete(table.name()));
        }
        let mut tables = self.tables.lock().await;
        let Some(stored) = tables.get_mut(&table) else {
            return Ok(0);
        };
        let before = stored.len();
        stored.retain(|row| !filters.iter().all(|f| f.matches(row)));
        Ok((before - stored.len()) as u64)
    }
}

fn encode_rows<T: serde::Serialize>(table: Table, items: &[T]) -> Result<Vec<JsonValue>, StoreError> {
    items
        .iter()
        .map(serde_json::to_value)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| StoreError::Codec {
            table: table.name(),
            source,
        })
}

fn decode_rows<T: DeserializeOwned>(table: Table, rows: Vec<JsonValue>) -> Result<Vec<T>, StoreError> {
    rows.into_iter()
        .map(serde_json::from_value)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| StoreError::Codec {
            table: table.name(),
            source,
        })
}

fn start_of(date: NaiveDate) -> String {
    date.and_time(NaiveTime::MIN)
        .format("%Y-%m-%dT%H:%M:%S")
        .to_string()
}

#[derive(Debug, Deserialize)]
struct DetailRow {
    booking_id: String,
    #[serde(default)]
    service: Option<String>,
    #[serde(default)]
    contact: Option<String>,
    #[serde(default)]
    channel: Option<Channel>,
}

#[derive(Debug, Deserialize)]
struct BookingKeyRow {
    booking_id: String,
    scheduled_start: NaiveDateTime,
}

/// Prior-run details for bookings starting on or after `from`.
pub async fn load_detail_cache(
    store: &dyn RecordStore,
    from: NaiveDate,
) -> Result<HashMap<String, CachedDetail>, StoreError> {
    let rows = store
        .get(Table::Bookings, &[Filter::gte("scheduled_start", start_of(from))])
        .await?;
    let rows: Vec<DetailRow> = decode_rows(Table::Bookings, rows)?;
    Ok(rows
        .into_iter()
        .map(|row| {
            (
                row.booking_id,
                CachedDetail {
                    service: row.service,
                    contact: row.contact,
                    channel: row.channel,
                },
            )
        })
        .collect())
}

pub async fn load_directory(store: &dyn RecordStore) -> Result<Vec<DirectoryEntry>, StoreError> {
    let rows = store.get(Table::Customers, &[]).await?;
    decode_rows(Table::Customers, rows)
}

pub async fn upsert_bookings(store: &dyn RecordStore, bookings: &[Booking]) -> Result<usize, StoreError> {
    if bookings.is_empty() {
        return Ok(0);
    }
    let rows = encode_rows(Table::Bookings, bookings)?;
    store.upsert(Table::Bookings, &rows, &["booking_id"]).await?;
    Ok(rows.len())
}

/// Stored booking ids with their dates, for bookings in `[from, until)`.
pub async fn booking_keys_between(
    store: &dyn RecordStore,
    from: NaiveDate,
    until: NaiveDate,
) -> Result<Vec<(String, NaiveDate)>, StoreError> {
    let rows = store
        .get(
            Table::Bookings,
            &[
                Filter::gte("scheduled_start", start_of(from)),
                Filter::lt("scheduled_start", start_of(until)),
            ],
        )
        .await?;
    let rows: Vec<BookingKeyRow> = decode_rows(Table::Bookings, rows)?;
    Ok(rows
        .into_iter()
        .map(|row| (row.booking_id, row.scheduled_start.date()))
        .collect())
}

pub async fn bookings_on(store: &dyn RecordStore, date: NaiveDate) -> Result<Vec<Booking>, StoreError> {
    let next = date.succ_opt().unwrap_or(date);
    let rows = store
        .get(
            Table::Bookings,
            &[
                Filter::gte("scheduled_start", start_of(date)),
                Filter::lt("scheduled_start", start_of(next)),
            ],
        )
        .await?;
    let mut bookings: Vec<Booking> = decode_rows(Table::Bookings, rows)?;
    bookings.sort_by(|a, b| {
        a.scheduled_start
            .cmp(&b.scheduled_start)
            .then_with(|| a.booking_id.cmp(&b.booking_id))
    });
    Ok(bookings)
}

pub async fn find_booking(store: &dyn RecordStore, booking_id: &str) -> Result<Option<Booking>, StoreError> {
    let rows = store
        .get(Table::Bookings, &[Filter::eq("booking_id", booking_id)])
        .await?;
    let mut bookings: Vec<Booking> = decode_rows(Table::Bookings, rows)?;
    Ok(bookings.pop())
}

pub async fn delete_booking(store: &dyn RecordStore, booking_id: &str) -> Result<u64, StoreError> {
    store
        .delete(Table::Bookings, &[Filter::eq("booking_id", booking_id)])
        .await
}

/// Replace every availability row of `date` with `slots`.
pub async fn replace_availability(
    store: &dyn RecordStore,
    date: NaiveDate,
    slots: &[AvailabilitySlot],
) -> Result<usize, StoreError> {
    store
        .delete(Table::AvailabilitySlots, &[Filter::eq("date", date)])
        .await?;
    if slots.is_empty() {
        return Ok(0);
    }
    let rows = encode_rows(Table::AvailabilitySlots, slots)?;
    store
        .upsert(Table::AvailabilitySlots, &rows, &["date", "staff_id"])
        .await?;
    Ok(rows.len())
}

pub async fn reminder_logged(
    store: &dyn RecordStore,
    recipient_key: &str,
    lead_days: u32,
    day: NaiveDate,
) -> Result<bool, StoreError> {
    let rows = store
        .get(
            Table::ReminderLogs,
            &[
                Filter::eq("recipient_key", recipient_key),
                Filter::eq("lead_days", lead_days),
                Filter::eq("sent_on", day),
            ],
        )
        .await?;
    Ok(!rows.is_empty())
}

pub async fn append_reminder_log(store: &dyn RecordStore, entry: &ReminderLog) -> Result<(), StoreError> {
    let rows = encode_rows(Table::ReminderLogs, std::slice::from_ref(entry))?;
    if let Err(err) = store.insert(Table::ReminderLogs, &rows).await {
        warn!(recipient = %entry.recipient_key, error = %err, "reminder log append failed");
        return Err(err);
    }
    Ok(())
}

/// Overwrite the outcome of an existing log row for the same recipient, lead time and day.
pub async fn record_reminder_outcome(store: &dyn RecordStore, entry: &ReminderLog) -> Result<(), StoreError> {
    let rows = encode_rows(Table::ReminderLogs, std::slice::from_ref(entry))?;
    if let Err(err) = store
        .upsert(Table::ReminderLogs, &rows, &["recipient_key", "lead_days", "sent_on"])
        .await
    {
        warn!(recipient = %entry.recipient_key, error = %err, "reminder outcome update failed");
        return Err(err);
    }
    Ok(())
}

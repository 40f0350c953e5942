//! Extraction adapter contracts + the fixture-backed upstream adapter.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rbm_core::{
    open_ranges, AvailabilityGrid, AvailabilitySlot, Channel, RawBooking, SessionCredential, TimeRange,
};
use rbm_storage::CredentialStore;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rbm-adapters";

/// An authenticated upstream session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub credential: SessionCredential,
    pub established_at: DateTime<Utc>,
    /// True when this session came from a fresh login rather than a restored credential.
    pub fresh: bool,
}

/// Everything upstream reported for one calendar date.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DayExtraction {
    pub bookings: Vec<RawBooking>,
    pub availability: Vec<AvailabilitySlot>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("upstream session expired")]
    SessionExpired,
    #[error("login failed: {0}")]
    LoginFailed(String),
    #[error("transient extraction failure: {0}")]
    Transient(String),
    #[error("booking {0} not found upstream")]
    NotFound(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Pulls one date worth of bookings and availability out of the upstream system.
#[async_trait]
pub trait ExtractionAdapter: Send + Sync {
    async fn extract(&self, date: NaiveDate, session: &Session) -> Result<DayExtraction, AdapterError>;
}

/// Establishes upstream sessions. Persisting refreshed credentials is the caller's job.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Reuse the last persisted credential, if any.
    async fn restore(&self) -> Result<Option<Session>, AdapterError>;

    /// Perform a fresh login.
    async fn login(&self) -> Result<Session, AdapterError>;
}

/// User-triggered changes pushed back into the upstream calendar.
#[async_trait]
pub trait UpstreamMutator: Send + Sync {
    async fn cancel(&self, booking_id: &str, session: &Session) -> Result<(), AdapterError>;

    async fn reschedule(
        &self,
        booking_id: &str,
        new_start: NaiveDateTime,
        session: &Session,
    ) -> Result<(), AdapterError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureDay {
    pub date: NaiveDate,
    #[serde(default)]
    pub bookings: Vec<FixtureBooking>,
    #[serde(default)]
    pub staff: Vec<FixtureStaffDay>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBooking {
    pub booking_id: String,
    pub name: String,
    /// `HH:MM`, business-local.
    pub time: String,
    #[serde(default)]
    pub contact: Option<String>,
    #[serde(default)]
    pub staff: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default)]
    pub duration_minutes: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureStaffDay {
    pub staff_id: String,
    pub staff_name: String,
    #[serde(default)]
    pub day_off: bool,
    #[serde(default)]
    pub booked: Vec<FixtureRange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureRange {
    pub start: String,
    pub end: String,
}

pub fn load_fixture_day(path: impl AsRef<Path>) -> Result<FixtureDay> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn write_json_file<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_string_pretty(value).context("serializing fixture day")?;
    fs::write(path, data).with_context(|| format!("writing {}", path.display()))
}

fn parse_clock(value: &str) -> Result<NaiveTime, AdapterError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|e| AdapterError::Transient(format!("bad clock time {value:?}: {e}")))
}

fn text_or_none(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Convert a fixture day into adapter output, deriving open ranges on `grid`.
pub fn fixture_day_to_extraction(
    day: &FixtureDay,
    grid: &AvailabilityGrid,
) -> Result<DayExtraction, AdapterError> {
    let mut bookings = Vec::with_capacity(day.bookings.len());
    for record in &day.bookings {
        let start = parse_clock(&record.time)?;
        bookings.push(RawBooking {
            booking_id: record.booking_id.clone(),
            subject_name: record.name.clone(),
            contact: text_or_none(record.contact.as_ref()),
            scheduled_start: day.date.and_time(start),
            staff: text_or_none(record.staff.as_ref()),
            service: text_or_none(record.service.as_ref()),
            channel: record.route.as_deref().map(Channel::from_route_label),
            duration_minutes: record.duration_minutes,
        });
    }

    let mut availability = Vec::with_capacity(day.staff.len());
    for staff in &day.staff {
        let ranges = if staff.day_off {
            Vec::new()
        } else {
            let booked = staff
                .booked
                .iter()
                .map(|r| Ok(TimeRange::new(parse_clock(&r.start)?, parse_clock(&r.end)?)))
                .collect::<Result<Vec<_>, AdapterError>>()?;
            open_ranges(grid, &booked)
        };
        availability.push(AvailabilitySlot {
            date: day.date,
            staff_id: staff.staff_id.clone(),
            staff_name: staff.staff_name.clone(),
            day_off: staff.day_off,
            open_ranges: ranges,
        });
    }

    Ok(DayExtraction {
        bookings,
        availability,
    })
}

/// Upstream calendar backed by one `YYYY-MM-DD.json` file per date.
///
/// A date without a file is an empty day. Mutations rewrite the files in place.
#[derive(Debug, Clone)]
pub struct FixtureExtractionAdapter {
    root: PathBuf,
    grid: AvailabilityGrid,
}

impl FixtureExtractionAdapter {
    pub fn new(root: impl Into<PathBuf>, grid: AvailabilityGrid) -> Self {
        Self {
            root: root.into(),
            grid,
        }
    }

    pub fn day_path(&self, date: NaiveDate) -> PathBuf {
        self.root.join(format!("{}.json", date.format("%Y-%m-%d")))
    }

    fn check_session(session: &Session) -> Result<(), AdapterError> {
        if session.credential.0.trim().is_empty() {
            return Err(AdapterError::SessionExpired);
        }
        Ok(())
    }

    fn load_or_empty(&self, date: NaiveDate) -> Result<FixtureDay, AdapterError> {
        let path = self.day_path(date);
        if !path.exists() {
            return Ok(FixtureDay {
                date,
                bookings: Vec::new(),
                staff: Vec::new(),
            });
        }
        load_fixture_day(&path).map_err(|e| AdapterError::Transient(format!("{e:#}")))
    }

    fn locate(&self, booking_id: &str) -> Result<(PathBuf, FixtureDay), AdapterError> {
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("reading {}", self.root.display()))?;
        let mut paths = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect::<Vec<_>>();
        paths.sort();
        for path in paths {
            let Ok(day) = load_fixture_day(&path) else {
                continue;
            };
            if day.bookings.iter().any(|b| b.booking_id == booking_id) {
                return Ok((path, day));
            }
        }
        Err(AdapterError::NotFound(booking_id.to_string()))
    }
}

#[async_trait]
impl ExtractionAdapter for FixtureExtractionAdapter {
    async fn extract(&self, date: NaiveDate, session: &Session) -> Result<DayExtraction, AdapterError> {
        Self::check_session(session)?;
        let day = self.load_or_empty(date)?;
        let extraction = fixture_day_to_extraction(&day, &self.grid)?;
        debug!(%date, bookings = extraction.bookings.len(), "fixture day extracted");
        Ok(extraction)
    }
}

#[async_trait]
impl UpstreamMutator for FixtureExtractionAdapter {
    async fn cancel(&self, booking_id: &str, session: &Session) -> Result<(), AdapterError> {
        Self::check_session(session)?;
        let (path, mut day) = self.locate(booking_id)?;
        day.bookings.retain(|b| b.booking_id != booking_id);
        write_json_file(&path, &day)?;
        Ok(())
    }

    async fn reschedule(
        &self,
        booking_id: &str,
        new_start: NaiveDateTime,
        session: &Session,
    ) -> Result<(), AdapterError> {
        Self::check_session(session)?;
        let (old_path, mut old_day) = self.locate(booking_id)?;
        let position = old_day
            .bookings
            .iter()
            .position(|b| b.booking_id == booking_id)
            .ok_or_else(|| AdapterError::NotFound(booking_id.to_string()))?;
        let mut moved = old_day.bookings.remove(position);
        moved.time = new_start.time().format("%H:%M").to_string();

        let new_date = new_start.date();
        if new_date == old_day.date {
            old_day.bookings.push(moved);
            write_json_file(&old_path, &old_day)?;
            return Ok(());
        }

        let mut new_day = self.load_or_empty(new_date)?;
        new_day.bookings.push(moved);
        write_json_file(&old_path, &old_day)?;
        write_json_file(&self.day_path(new_date), &new_day)?;
        Ok(())
    }
}

/// Session provider for the fixture upstream: restores the stored credential,
/// and a login mints a new random one.
#[derive(Debug, Clone)]
pub struct FixtureSessionProvider {
    credentials: Arc<CredentialStore>,
}

impl FixtureSessionProvider {
    pub fn new(credentials: Arc<CredentialStore>) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl SessionProvider for FixtureSessionProvider {
    async fn restore(&self) -> Result<Option<Session>, AdapterError> {
        let stored = self.credentials.load().await?;
        Ok(stored.map(|credential| Session {
            credential,
            established_at: Utc::now(),
            fresh: false,
        }))
    }

    async fn login(&self) -> Result<Session, AdapterError> {
        Ok(Session {
            credential: SessionCredential(format!("fixture-{}", Uuid::new_v4())),
            established_at: Utc::now(),
            fresh: true,
        })
    }
}

use std::collections::{BTreeSet, HashSet};

use chrono::{Days, NaiveDate};
use rbm_core::Booking;
use rbm_storage::{booking_keys_between, delete_booking, RecordStore, StoreError};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::ReliabilityThresholds;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Reliability {
    pub fetched: usize,
    pub incomplete: usize,
    pub reliable: bool,
}

impl Reliability {
    pub fn incomplete_ratio(&self) -> f64 {
        if self.fetched == 0 {
            0.0
        } else {
            self.incomplete as f64 / self.fetched as f64
        }
    }
}

/// Whether a run's output can be trusted enough to delete anything.
pub fn assess_reliability(batch: &[Booking], thresholds: &ReliabilityThresholds) -> Reliability {
    let fetched = batch.len();
    let incomplete = batch.iter().filter(|b| b.is_incomplete()).count();
    let mut assessed = Reliability {
        fetched,
        incomplete,
        reliable: false,
    };
    assessed.reliable =
        fetched >= thresholds.min_fetched && assessed.incomplete_ratio() < thresholds.max_incomplete_ratio;
    assessed
}

/// Stored ids on extracted dates that the run did not see again, sorted.
pub fn stale_ids(
    stored: &[(String, NaiveDate)],
    scraped: &HashSet<&str>,
    covered: &BTreeSet<NaiveDate>,
) -> Vec<String> {
    let mut stale: Vec<String> = stored
        .iter()
        .filter(|(id, date)| covered.contains(date) && !scraped.contains(id.as_str()))
        .map(|(id, _)| id.clone())
        .collect();
    stale.sort();
    stale.dedup();
    stale
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PruneOutcome {
    Skipped { reliability: Reliability },
    Pruned { reliability: Reliability, stale: Vec<String>, deleted: u64 },
}

/// Delete stored bookings in `[today, today + days)` that the run no longer sees.
///
/// Nothing is deleted unless the batch passes the reliability predicate.
pub async fn prune(
    store: &dyn RecordStore,
    today: NaiveDate,
    days: u32,
    batch: &[Booking],
    covered: &BTreeSet<NaiveDate>,
    thresholds: &ReliabilityThresholds,
) -> Result<PruneOutcome, StoreError> {
    let reliability = assess_reliability(batch, thresholds);
    if !reliability.reliable {
        warn!(
            fetched = reliability.fetched,
            incomplete = reliability.incomplete,
            ratio = reliability.incomplete_ratio(),
            "extraction looks degraded, skipping stale booking deletion"
        );
        return Ok(PruneOutcome::Skipped { reliability });
    }

    let until = today
        .checked_add_days(Days::new(u64::from(days)))
        .unwrap_or(NaiveDate::MAX);
    let stored = booking_keys_between(store, today, until).await?;
    let scraped: HashSet<&str> = batch.iter().map(|b| b.booking_id.as_str()).collect();
    let stale = stale_ids(&stored, &scraped, covered);

    let mut deleted = 0;
    for id in &stale {
        deleted += delete_booking(store, id).await?;
    }
    info!(stale = stale.len(), deleted, "stale bookings pruned");
    Ok(PruneOutcome::Pruned {
        reliability,
        stale,
        deleted,
    })
}

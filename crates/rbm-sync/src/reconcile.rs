//! One reconciliation run: partition, extract, merge, write, prune, account.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use rbm_core::RawBooking;
use rbm_storage::{load_detail_cache, load_directory, replace_availability, upsert_bookings, BackoffPolicy, RecordStore};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::ReliabilityThresholds;
use crate::monitor::{EngineState, RunPermit};
use crate::notify::{send_best_effort, MessageSender};
use crate::partition::{extract_horizon, WorkerContext, WorkerOutcome};
use crate::prune::{prune, PruneOutcome};
use crate::resolve::resolve;
use crate::{business_today, TriggerOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub today: NaiveDate,
    pub days: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub partitions: usize,
    pub session_failures: usize,
    pub failed_dates: Vec<NaiveDate>,
    pub fetched: usize,
    pub duplicate_ids: usize,
    pub channel_overrides: usize,
    pub anomalies: usize,
    pub written: usize,
    pub availability_rows: usize,
    pub prune: Option<PruneOutcome>,
    pub consecutive_failures: u32,
    pub alert_fired: bool,
    pub error: Option<String>,
}

impl RunReport {
    fn new(run_id: Uuid, today: NaiveDate, days: u32) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            today,
            days,
            started_at: now,
            finished_at: now,
            status: RunStatus::Succeeded,
            partitions: 0,
            session_failures: 0,
            failed_dates: Vec::new(),
            fetched: 0,
            duplicate_ids: 0,
            channel_overrides: 0,
            anomalies: 0,
            written: 0,
            availability_rows: 0,
            prune: None,
            consecutive_failures: 0,
            alert_fired: false,
            error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    pub workers: usize,
    pub timezone: Tz,
    pub reliability: ReliabilityThresholds,
    pub alert_recipient: Option<String>,
    pub retry: BackoffPolicy,
}

pub struct Reconciler {
    workers: WorkerContext,
    store: Arc<dyn RecordStore>,
    sender: Arc<dyn MessageSender>,
    state: Arc<EngineState>,
    options: ReconcilerOptions,
}

impl Reconciler {
    pub fn new(
        workers: WorkerContext,
        store: Arc<dyn RecordStore>,
        sender: Arc<dyn MessageSender>,
        state: Arc<EngineState>,
        options: ReconcilerOptions,
    ) -> Self {
        Self {
            workers,
            store,
            sender,
            state,
            options,
        }
    }

    pub fn state(&self) -> &Arc<EngineState> {
        &self.state
    }

    /// Start a run in the background, or reject it if one is already in flight.
    pub fn trigger(self: &Arc<Self>, days: u32) -> TriggerOutcome {
        let Some(permit) = self.state.reconcile_guard.try_acquire() else {
            warn!(days, "reconciliation already running, rejecting trigger");
            return TriggerOutcome::Rejected;
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let today = business_today(this.options.timezone);
            this.run_with_permit(permit, today, days).await;
        });
        TriggerOutcome::Accepted
    }

    /// Run in the foreground for business-local today. `None` when a run is already in flight.
    pub async fn run_exclusive(&self, days: u32) -> Option<RunReport> {
        let Some(permit) = self.state.reconcile_guard.try_acquire() else {
            warn!(days, "reconciliation already running, skipping");
            return None;
        };
        let today = business_today(self.options.timezone);
        Some(self.run_with_permit(permit, today, days).await)
    }

    async fn run_with_permit(&self, _permit: RunPermit, today: NaiveDate, days: u32) -> RunReport {
        self.run_once(today, days).await
    }

    /// One full run over `[today, today + days)`. Never returns an error: the
    /// outcome is classified, counted by the failure monitor and reported.
    pub async fn run_once(&self, today: NaiveDate, days: u32) -> RunReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("reconcile_run", %run_id, days);
        async move {
            let mut report = RunReport::new(run_id, today, days);
            info!(%today, workers = self.options.workers, "reconciliation started");

            let outcomes = extract_horizon(&self.workers, today, days, self.options.workers).await;
            report.partitions = outcomes.len();
            report.session_failures = outcomes.iter().filter(|o| o.session_failed).count();
            report.failed_dates = outcomes.iter().flat_map(|o| o.failed_dates.iter().copied()).collect();

            let result = if !outcomes.is_empty() && report.session_failures == outcomes.len() {
                Err(anyhow::anyhow!("no worker could establish an upstream session"))
            } else {
                self.commit(today, days, &outcomes, &mut report).await
            };

            match result {
                Ok(()) => {
                    self.state.failures.record_success();
                    report.status = RunStatus::Succeeded;
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    error!(error = %message, "reconciliation failed");
                    report.status = RunStatus::Failed;
                    report.error = Some(message);
                    if self.state.failures.record_failure() {
                        report.alert_fired = true;
                        self.alert(&report).await;
                    }
                }
            }
            report.consecutive_failures = self.state.failures.consecutive_failures();
            report.finished_at = Utc::now();
            info!(
                status = ?report.status,
                fetched = report.fetched,
                written = report.written,
                session_failures = report.session_failures,
                consecutive_failures = report.consecutive_failures,
                "reconciliation finished"
            );
            self.state.record_report(report.clone()).await;
            report
        }
        .instrument(span)
        .await
    }

    async fn commit(
        &self,
        today: NaiveDate,
        days: u32,
        outcomes: &[WorkerOutcome],
        report: &mut RunReport,
    ) -> Result<()> {
        let store = self.store.as_ref();
        let raw: Vec<RawBooking> = outcomes.iter().flat_map(|o| o.bookings.iter().cloned()).collect();
        report.fetched = raw.len();

        let cache = load_detail_cache(store, today)
            .await
            .context("loading prior booking details")?;
        let directory = load_directory(store).await.context("loading customer directory")?;

        let resolution = resolve(&raw, &cache, &directory);
        for collision in &resolution.report.anomalies {
            warn!(
                contact = %collision.contact,
                start = %collision.scheduled_start,
                kept = %collision.kept,
                dropped = %collision.dropped,
                channel = collision.kept_channel.as_str(),
                "same-slot collision outside the channel rule, kept first seen"
            );
        }
        report.duplicate_ids = resolution.report.duplicate_ids;
        report.channel_overrides = resolution.report.channel_overrides.len();
        report.anomalies = resolution.report.anomalies.len();

        report.written = upsert_bookings(store, &resolution.batch)
            .await
            .context("writing booking batch")?;

        let mut covered = BTreeSet::new();
        for outcome in outcomes {
            for (date, slots) in &outcome.availability {
                report.availability_rows += replace_availability(store, *date, slots)
                    .await
                    .with_context(|| format!("replacing availability for {date}"))?;
                covered.insert(*date);
            }
        }

        let pruned = prune(store, today, days, &resolution.batch, &covered, &self.options.reliability)
            .await
            .context("pruning stale bookings")?;
        report.prune = Some(pruned);
        Ok(())
    }

    async fn alert(&self, report: &RunReport) {
        let Some(recipient) = self.options.alert_recipient.as_deref() else {
            warn!("failure threshold reached but no alert recipient is configured");
            return;
        };
        let text = format!(
            "⚠️ 予約同期が{}回連続で失敗しました\n{}",
            self.state.failures.consecutive_failures(),
            report.error.as_deref().unwrap_or("unknown error")
        );
        if !send_best_effort(self.sender.as_ref(), recipient, &text, &self.options.retry).await {
            warn!("failure alert could not be delivered");
        }
    }
}

/// Reject a `days_limit` outside what a run can cover.
pub fn validate_days(days: u32, max_days: u32) -> Result<u32> {
    if days == 0 || days > max_days {
        bail!("days_limit must be between 1 and {max_days}, got {days}");
    }
    Ok(days)
}

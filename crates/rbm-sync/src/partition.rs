//! Horizon partitioning and the per-partition extraction workers.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::Arc;

use chrono::{Days, NaiveDate};
use rbm_adapters::{AdapterError, ExtractionAdapter, Session, SessionProvider};
use rbm_core::{AvailabilitySlot, RawBooking};
use rbm_storage::CredentialStore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Split `[0, days)` into `max(workers, 1)` contiguous day-index ranges.
///
/// Earlier partitions take the remainder, so sizes differ by at most one.
/// When there are more workers than days the trailing ranges are empty.
pub fn partition_horizon(days: u32, workers: usize) -> Vec<Range<u32>> {
    let workers = u32::try_from(workers.max(1)).unwrap_or(u32::MAX);
    let base = days / workers;
    let remainder = days % workers;
    let mut start = 0;
    (0..workers)
        .map(|index| {
            let len = base + u32::from(index < remainder);
            let range = start..start + len;
            start += len;
            range
        })
        .collect()
}

/// Capabilities a worker needs: where to extract from and how to get a session.
#[derive(Clone)]
pub struct WorkerContext {
    pub adapter: Arc<dyn ExtractionAdapter>,
    pub sessions: Arc<dyn SessionProvider>,
    pub credentials: Arc<CredentialStore>,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerOutcome {
    pub partition: usize,
    pub bookings: Vec<RawBooking>,
    /// Availability per successfully extracted date.
    pub availability: BTreeMap<NaiveDate, Vec<AvailabilitySlot>>,
    pub failed_dates: Vec<NaiveDate>,
    pub session_failed: bool,
}

impl WorkerOutcome {
    fn aborted(partition: usize) -> Self {
        Self {
            partition,
            session_failed: true,
            ..Self::default()
        }
    }

    pub fn covered_dates(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.availability.keys().copied()
    }
}

/// Log in and persist the refreshed credential for the other workers.
pub async fn fresh_login(
    sessions: &dyn SessionProvider,
    credentials: &CredentialStore,
) -> Result<Session, AdapterError> {
    let session = sessions.login().await?;
    match credentials.persist(&session.credential).await {
        Ok(persisted) => debug!(
            fingerprint = %persisted.fingerprint,
            unchanged = persisted.unchanged,
            "session credential persisted"
        ),
        Err(err) => warn!(error = %format!("{err:#}"), "could not persist session credential"),
    }
    Ok(session)
}

/// Reuse the persisted credential when there is one, otherwise log in.
pub async fn acquire_session(
    sessions: &dyn SessionProvider,
    credentials: &CredentialStore,
) -> Result<Session, AdapterError> {
    match sessions.restore().await {
        Ok(Some(session)) => return Ok(session),
        Ok(None) => {}
        Err(err) => warn!(error = %err, "restoring session failed, logging in"),
    }
    fresh_login(sessions, credentials).await
}

/// Extract every date of one partition over a single session.
///
/// A session that expires gets one re-login per worker. If that fails, or the
/// session expires a second time, the whole partition is given up.
pub async fn run_worker(ctx: WorkerContext, partition: usize, dates: Vec<NaiveDate>) -> WorkerOutcome {
    let mut outcome = WorkerOutcome {
        partition,
        ..WorkerOutcome::default()
    };
    if dates.is_empty() {
        return outcome;
    }

    let mut session = match acquire_session(ctx.sessions.as_ref(), &ctx.credentials).await {
        Ok(session) => session,
        Err(err) => {
            warn!(error = %err, "no upstream session, abandoning partition");
            return WorkerOutcome::aborted(partition);
        }
    };
    let mut reauthenticated = false;

    for date in dates {
        let mut result = ctx.adapter.extract(date, &session).await;
        if matches!(result, Err(AdapterError::SessionExpired)) && !reauthenticated {
            reauthenticated = true;
            info!(%date, "session expired, logging in again");
            session = match fresh_login(ctx.sessions.as_ref(), &ctx.credentials).await {
                Ok(session) => session,
                Err(err) => {
                    warn!(error = %err, "re-login failed, abandoning partition");
                    return WorkerOutcome::aborted(partition);
                }
            };
            result = ctx.adapter.extract(date, &session).await;
        }

        match result {
            Ok(day) => {
                outcome.bookings.extend(day.bookings);
                outcome.availability.insert(date, day.availability);
            }
            Err(AdapterError::SessionExpired) => {
                warn!(%date, "session expired again, abandoning partition");
                return WorkerOutcome::aborted(partition);
            }
            Err(err) => {
                warn!(%date, error = %err, "date extraction failed, skipping");
                outcome.failed_dates.push(date);
            }
        }
    }
    outcome
}

/// Fan out one worker per non-empty partition of `[today, today + days)` and
/// wait for all of them. Outcomes come back ordered by partition.
pub async fn extract_horizon(
    ctx: &WorkerContext,
    today: NaiveDate,
    days: u32,
    workers: usize,
) -> Vec<WorkerOutcome> {
    let mut set = JoinSet::new();
    let mut partitions = HashMap::new();

    for (index, range) in partition_horizon(days, workers).into_iter().enumerate() {
        if range.is_empty() {
            continue;
        }
        let dates: Vec<NaiveDate> = range
            .filter_map(|offset| today.checked_add_days(Days::new(u64::from(offset))))
            .collect();
        let span = info_span!("extract_worker", partition = index, days = dates.len());
        let handle = set.spawn(run_worker(ctx.clone(), index, dates).instrument(span));
        partitions.insert(handle.id(), index);
    }

    let mut outcomes = Vec::with_capacity(partitions.len());
    while let Some(joined) = set.join_next_with_id().await {
        match joined {
            Ok((_, outcome)) => outcomes.push(outcome),
            Err(err) => {
                let partition = partitions.get(&err.id()).copied().unwrap_or_default();
                error!(partition, error = %err, "extraction worker crashed");
                outcomes.push(WorkerOutcome::aborted(partition));
            }
        }
    }
    outcomes.sort_by_key(|o| o.partition);
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use rbm_adapters::DayExtraction;
    use rbm_core::SessionCredential;
    use tempfile::tempdir;

    #[test]
    fn partitions_cover_horizon_without_gaps_or_overlaps() {
        for days in [1u32, 14, 56] {
            for workers in [1usize, 4, 6] {
                let parts = partition_horizon(days, workers);
                assert_eq!(parts.len(), workers);
                let mut next = 0;
                for part in &parts {
                    assert_eq!(part.start, next, "gap or overlap at D={days} W={workers}");
                    next = part.end;
                }
                assert_eq!(next, days);
                let sizes: Vec<u32> = parts.iter().map(|p| p.end - p.start).collect();
                let spread = sizes.iter().max().unwrap() - sizes.iter().min().unwrap();
                assert!(spread <= 1);
            }
        }
    }

    #[test]
    fn earlier_partitions_take_the_remainder() {
        assert_eq!(partition_horizon(14, 4), vec![0..4, 4..8, 8..11, 11..14]);
        assert_eq!(partition_horizon(1, 4), vec![0..1, 1..1, 1..1, 1..1]);
        assert_eq!(partition_horizon(10, 0), vec![0..10]);
    }

    /// Accepts only credentials it issued through `FakeSessions::login`.
    struct FakeAdapter {
        accepted: std::sync::Mutex<HashSet<String>>,
        failing: HashSet<NaiveDate>,
        expire_everything: bool,
    }

    #[async_trait]
    impl ExtractionAdapter for FakeAdapter {
        async fn extract(&self, date: NaiveDate, session: &Session) -> Result<DayExtraction, AdapterError> {
            if self.expire_everything || !self.accepted.lock().unwrap().contains(&session.credential.0) {
                return Err(AdapterError::SessionExpired);
            }
            if self.failing.contains(&date) {
                return Err(AdapterError::Transient("timeout".into()));
            }
            Ok(DayExtraction {
                bookings: vec![RawBooking {
                    booking_id: format!("B-{date}"),
                    subject_name: "田中".into(),
                    contact: Some("09000000000".into()),
                    scheduled_start: date.and_hms_opt(10, 0, 0).unwrap(),
                    staff: None,
                    service: Some("カット".into()),
                    channel: None,
                    duration_minutes: None,
                }],
                availability: Vec::new(),
            })
        }
    }

    struct FakeSessions {
        adapter: Arc<FakeAdapter>,
        restore_with: Option<String>,
        fail_login: bool,
        logins: AtomicUsize,
    }

    #[async_trait]
    impl SessionProvider for FakeSessions {
        async fn restore(&self) -> Result<Option<Session>, AdapterError> {
            Ok(self.restore_with.clone().map(|c| Session {
                credential: SessionCredential(c),
                established_at: Utc::now(),
                fresh: false,
            }))
        }

        async fn login(&self) -> Result<Session, AdapterError> {
            if self.fail_login {
                return Err(AdapterError::LoginFailed("bad password".into()));
            }
            let n = self.logins.fetch_add(1, Ordering::SeqCst);
            let credential = format!("fresh-{n}");
            self.adapter.accepted.lock().unwrap().insert(credential.clone());
            Ok(Session {
                credential: SessionCredential(credential),
                established_at: Utc::now(),
                fresh: true,
            })
        }
    }

    struct Harness {
        ctx: WorkerContext,
        sessions: Arc<FakeSessions>,
        credentials: Arc<CredentialStore>,
        _dir: tempfile::TempDir,
    }

    fn harness(restore_with: Option<&str>, failing: &[NaiveDate], expire_everything: bool, fail_login: bool) -> Harness {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(FakeAdapter {
            accepted: std::sync::Mutex::new(HashSet::new()),
            failing: failing.iter().copied().collect(),
            expire_everything,
        });
        let sessions = Arc::new(FakeSessions {
            adapter: adapter.clone(),
            restore_with: restore_with.map(str::to_string),
            fail_login,
            logins: AtomicUsize::new(0),
        });
        let credentials = Arc::new(CredentialStore::new(dir.path().join("session.json")));
        Harness {
            ctx: WorkerContext {
                adapter,
                sessions: sessions.clone(),
                credentials: credentials.clone(),
            },
            sessions,
            credentials,
            _dir: dir,
        }
    }

    fn dates(n: u64) -> Vec<NaiveDate> {
        let start = NaiveDate::from_ymd_opt(2026, 12, 30).unwrap();
        (0..n).map(|i| start + Days::new(i)).collect()
    }

    #[tokio::test]
    async fn stale_restored_session_gets_one_relogin_and_persists_it() {
        let h = harness(Some("stale"), &[], false, false);
        let outcome = run_worker(h.ctx.clone(), 0, dates(3)).await;

        assert!(!outcome.session_failed);
        assert_eq!(outcome.bookings.len(), 3);
        assert_eq!(outcome.covered_dates().count(), 3);
        assert_eq!(h.sessions.logins.load(Ordering::SeqCst), 1);
        let stored = h.credentials.load().await.unwrap().unwrap();
        assert_eq!(stored.0, "fresh-0");
    }

    #[tokio::test]
    async fn second_expiry_abandons_the_partition() {
        let h = harness(None, &[], true, false);
        let outcome = run_worker(h.ctx.clone(), 2, dates(4)).await;

        assert!(outcome.session_failed);
        assert_eq!(outcome.partition, 2);
        assert!(outcome.bookings.is_empty());
        assert!(outcome.availability.is_empty());
        // initial login plus the single re-login
        assert_eq!(h.sessions.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_login_abandons_the_partition() {
        let h = harness(None, &[], false, true);
        let outcome = run_worker(h.ctx.clone(), 0, dates(2)).await;
        assert!(outcome.session_failed);
        assert!(h.credentials.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transient_date_failure_skips_only_that_date() {
        let all = dates(3);
        let h = harness(None, &all[1..2], false, false);
        let outcome = run_worker(h.ctx.clone(), 0, all.clone()).await;

        assert!(!outcome.session_failed);
        assert_eq!(outcome.failed_dates, vec![all[1]]);
        assert_eq!(outcome.covered_dates().collect::<Vec<_>>(), vec![all[0], all[2]]);
        assert_eq!(outcome.bookings.len(), 2);
    }

    #[tokio::test]
    async fn horizon_fan_out_returns_outcomes_in_partition_order() {
        let h = harness(None, &[], false, false);
        let today = NaiveDate::from_ymd_opt(2026, 12, 30).unwrap();
        let outcomes = extract_horizon(&h.ctx, today, 14, 4).await;

        assert_eq!(outcomes.iter().map(|o| o.partition).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        let covered: Vec<NaiveDate> = outcomes.iter().flat_map(|o| o.covered_dates()).collect();
        assert_eq!(covered.len(), 14);
        assert_eq!(covered[0], today);
        assert_eq!(*covered.last().unwrap(), NaiveDate::from_ymd_opt(2027, 1, 12).unwrap());
    }

    #[tokio::test]
    async fn empty_partitions_spawn_no_worker() {
        let h = harness(None, &[], false, false);
        let today = NaiveDate::from_ymd_opt(2026, 12, 30).unwrap();
        let outcomes = extract_horizon(&h.ctx, today, 2, 6).await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(h.sessions.logins.load(Ordering::SeqCst), 2);
    }
}

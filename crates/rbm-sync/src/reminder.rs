//! Lead-time reminders with at-most-once delivery per recipient, lead time and day.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result};
use chrono::{Datelike, Days, NaiveDate, NaiveDateTime, Utc};
use rbm_core::{normalize_contact, normalize_subject_name, Booking, DirectoryEntry, ReminderLog, ReminderOutcome};
use rbm_storage::{
    append_reminder_log, bookings_on, load_directory, record_reminder_outcome, reminder_logged, BackoffPolicy, RecordStore,
};
use regex::Regex;
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::config::ReminderSettings;
use crate::monitor::RunGuard;
use crate::notify::{send_best_effort, send_with_retry, MessageSender};

const WEEKDAYS: [&str; 7] = ["月", "火", "水", "木", "金", "土", "日"];

/// `12月16日(火)11:30〜`, with the weekday taken from the calendar date itself.
pub fn format_visit(start: NaiveDateTime) -> String {
    let weekday = WEEKDAYS[start.weekday().num_days_from_monday() as usize];
    format!(
        "{}月{}日({}){}〜",
        start.month(),
        start.day(),
        weekday,
        start.format("%H:%M")
    )
}

static BRACKET_TAGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"【[^】]*】|《[^》]*》|\(ｸｰﾎﾟﾝ\)").expect("valid tag regex"));
static PRICES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[¥￥][0-9,]+").expect("valid price regex"));
static SPACES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid space regex"));

/// Strip promo tags and prices from a menu description and join its `◇` parts with `＋`.
pub fn clean_service(raw: &str) -> String {
    let stripped = BRACKET_TAGS.replace_all(raw, "");
    let stripped = PRICES.replace_all(&stripped, "");
    let parts: Vec<&str> = stripped
        .split('◇')
        .map(|p| p.trim_matches(|c: char| c.is_whitespace()))
        .filter(|p| !p.is_empty())
        .collect();
    SPACES.replace_all(&parts.join("＋"), " ").trim().to_string()
}

pub fn render_template(template: &str, name: &str, when: &str, service: &str) -> String {
    template
        .replace("{name}", name)
        .replace("{when}", when)
        .replace("{service}", service)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LeadReport {
    pub lead_days: u32,
    pub target_date: Option<NaiveDate>,
    pub candidates: usize,
    pub sent: usize,
    pub failed: usize,
    pub already_sent: usize,
    pub unresolved: usize,
    pub not_allowed: usize,
    pub log_failures: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReminderReport {
    pub day: NaiveDate,
    pub leads: Vec<LeadReport>,
}

struct Recipients<'a> {
    by_contact: HashMap<String, &'a DirectoryEntry>,
    by_name: HashMap<String, Option<&'a DirectoryEntry>>,
}

impl<'a> Recipients<'a> {
    fn new(directory: &'a [DirectoryEntry]) -> Self {
        let mut by_contact = HashMap::new();
        let mut by_name: HashMap<String, Option<&DirectoryEntry>> = HashMap::new();
        for entry in directory.iter().filter(|e| e.recipient_id.is_some()) {
            if let Some(contact) = entry.contact.as_deref().and_then(normalize_contact) {
                by_contact.entry(contact).or_insert(entry);
            }
            let name = normalize_subject_name(&entry.name);
            if name.is_empty() {
                continue;
            }
            by_name
                .entry(name)
                .and_modify(|existing| {
                    if existing.map(|e| e.recipient_id != entry.recipient_id).unwrap_or(true) {
                        *existing = None;
                    }
                })
                .or_insert(Some(entry));
        }
        Self { by_contact, by_name }
    }

    /// Exact contact first, then exact normalized name.
    fn resolve(&self, booking: &Booking) -> Option<&'a DirectoryEntry> {
        if let Some(entry) = booking
            .contact
            .as_deref()
            .and_then(normalize_contact)
            .and_then(|c| self.by_contact.get(&c))
        {
            return Some(*entry);
        }
        self.by_name
            .get(&normalize_subject_name(&booking.subject_name))
            .copied()
            .flatten()
    }
}

pub struct ReminderNotifier {
    store: Arc<dyn RecordStore>,
    sender: Arc<dyn MessageSender>,
    settings: ReminderSettings,
    staff_recipients: Vec<String>,
    retry: BackoffPolicy,
    guard: RunGuard,
}

impl ReminderNotifier {
    pub fn new(
        store: Arc<dyn RecordStore>,
        sender: Arc<dyn MessageSender>,
        settings: ReminderSettings,
        staff_recipients: Vec<String>,
        retry: BackoffPolicy,
        guard: RunGuard,
    ) -> Self {
        Self {
            store,
            sender,
            settings,
            staff_recipients,
            retry,
            guard,
        }
    }

    fn allowed(&self, entry: &DirectoryEntry, booking: &Booking) -> bool {
        if self.settings.allow_list.is_empty() {
            return true;
        }
        let contact = booking
            .contact
            .as_deref()
            .or(entry.contact.as_deref())
            .and_then(normalize_contact);
        contact.is_some_and(|c| {
            self.settings
                .allow_list
                .iter()
                .any(|allowed| normalize_contact(allowed).as_deref() == Some(c.as_str()))
        })
    }

    /// Send every reminder due on `today` (business-local date).
    ///
    /// `None` when another pass already holds the guard.
    pub async fn run(&self, today: NaiveDate) -> Result<Option<ReminderReport>> {
        let Some(_permit) = self.guard.try_acquire() else {
            warn!(%today, "reminder pass already running, skipping");
            return Ok(None);
        };
        let directory = load_directory(self.store.as_ref())
            .await
            .context("loading customer directory")?;
        let recipients = Recipients::new(&directory);

        let mut leads = Vec::with_capacity(self.settings.lead_days.len());
        for &lead_days in &self.settings.lead_days {
            let span = info_span!("reminder_lead", lead_days);
            let report = self
                .run_lead(today, lead_days, &recipients)
                .instrument(span)
                .await?;
            leads.push(report);
        }
        Ok(Some(ReminderReport { day: today, leads }))
    }

    async fn run_lead(&self, today: NaiveDate, lead_days: u32, recipients: &Recipients<'_>) -> Result<LeadReport> {
        let mut report = LeadReport {
            lead_days,
            ..LeadReport::default()
        };
        let Some(template) = self.settings.templates.get(&lead_days) else {
            warn!("no template for lead time, skipping");
            return Ok(report);
        };
        let Some(target) = today.checked_add_days(Days::new(u64::from(lead_days))) else {
            return Ok(report);
        };
        report.target_date = Some(target);

        let bookings = bookings_on(self.store.as_ref(), target)
            .await
            .with_context(|| format!("loading bookings on {target}"))?;
        report.candidates = bookings.len();

        for booking in &bookings {
            let Some(entry) = recipients.resolve(booking) else {
                report.unresolved += 1;
                continue;
            };
            let Some(recipient) = entry.recipient_id.as_deref() else {
                report.unresolved += 1;
                continue;
            };
            if !self.allowed(entry, booking) {
                report.not_allowed += 1;
                continue;
            }
            if reminder_logged(self.store.as_ref(), recipient, lead_days, today)
                .await
                .context("checking reminder log")?
            {
                report.already_sent += 1;
                continue;
            }

            // Claim the row before pushing: no row, no message.
            let mut log = ReminderLog {
                recipient_key: recipient.to_string(),
                lead_days,
                sent_on: today,
                subject_name: booking.subject_name.clone(),
                outcome: ReminderOutcome::Pending,
                logged_at: Utc::now(),
            };
            if append_reminder_log(self.store.as_ref(), &log).await.is_err() {
                report.log_failures += 1;
                continue;
            }

            let service = booking.service.as_deref().map(clean_service).unwrap_or_default();
            let message = render_template(
                template,
                &booking.subject_name,
                &format_visit(booking.scheduled_start),
                &service,
            );
            log.outcome = match send_with_retry(self.sender.as_ref(), recipient, &message, &self.retry).await {
                Ok(()) => {
                    report.sent += 1;
                    ReminderOutcome::Sent
                }
                Err(_) => {
                    report.failed += 1;
                    ReminderOutcome::Failed
                }
            };
            log.logged_at = Utc::now();
            if record_reminder_outcome(self.store.as_ref(), &log).await.is_err() {
                report.log_failures += 1;
            }

            if log.outcome == ReminderOutcome::Sent {
                let notice = format!("✅ リマインド送信完了\n{}様（{}日前）", booking.subject_name, lead_days);
                for staff in &self.staff_recipients {
                    send_best_effort(self.sender.as_ref(), staff, &notice, &self.retry).await;
                }
            }
        }

        info!(
            candidates = report.candidates,
            sent = report.sent,
            failed = report.failed,
            already_sent = report.already_sent,
            unresolved = report.unresolved,
            log_failures = report.log_failures,
            "reminder pass finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use rbm_core::Channel;
    use rbm_storage::{upsert_bookings, Filter, MemoryRecordStore, StoreError, Table};
    use serde_json::json;

    use crate::notify::{DryRunSender, SendError};

    fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d).unwrap().and_hms_opt(h, mi, 0).unwrap()
    }

    fn fast() -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 0,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn weekday_follows_the_real_calendar_across_boundaries() {
        assert_eq!(format_visit(dt(2025, 12, 16, 11, 30)), "12月16日(火)11:30〜");
        assert_eq!(format_visit(dt(2025, 12, 31, 9, 0)), "12月31日(水)09:00〜");
        assert_eq!(format_visit(dt(2026, 1, 1, 18, 0)), "1月1日(木)18:00〜");
        assert_eq!(format_visit(dt(2026, 3, 1, 10, 0)), "3月1日(日)10:00〜");
    }

    #[test]
    fn service_cleanup_drops_tags_and_prices() {
        assert_eq!(clean_service("【平日限定】カット◇カラー ¥8,800"), "カット＋カラー");
        assert_eq!(clean_service("《人気No.1》まつげパーマ(ｸｰﾎﾟﾝ)◇"), "まつげパーマ");
        assert_eq!(clean_service("ヘッドスパ"), "ヘッドスパ");
    }

    fn booking(id: &str, name: &str, contact: Option<&str>, start: NaiveDateTime) -> Booking {
        Booking {
            booking_id: id.into(),
            subject_name: name.into(),
            contact: contact.map(str::to_string),
            scheduled_start: start,
            staff: None,
            service: Some("【平日限定】カット◇カラー ¥8,800".into()),
            channel: Channel::DirectRepeat,
            duration_minutes: 60,
        }
    }

    async fn seeded_store(today: NaiveDate) -> Arc<MemoryRecordStore> {
        let store = Arc::new(MemoryRecordStore::new());
        let three = (today + Days::new(3)).and_hms_opt(11, 30, 0).unwrap();
        let seven = (today + Days::new(7)).and_hms_opt(14, 0, 0).unwrap();
        upsert_bookings(
            store.as_ref(),
            &[
                booking("A", "田中", Some("09011112222"), three),
                booking("B", "鈴木", None, seven),
                booking("C", "不明", None, three),
            ],
        )
        .await
        .unwrap();
        store
            .seed(
                Table::Customers,
                vec![
                    json!({"name": "田中 太郎", "contact": "090-1111-2222", "recipient_id": "U-tanaka"}),
                    json!({"name": "鈴木", "contact": "08000000000", "recipient_id": "U-suzuki"}),
                ],
            )
            .await;
        store
    }

    fn notifier(store: Arc<MemoryRecordStore>, sender: Arc<dyn MessageSender>, staff: &[&str]) -> ReminderNotifier {
        ReminderNotifier::new(
            store,
            sender,
            ReminderSettings::default(),
            staff.iter().map(|s| s.to_string()).collect(),
            fast(),
            RunGuard::new(),
        )
    }

    #[tokio::test]
    async fn second_run_on_the_same_day_sends_nothing() {
        let today = NaiveDate::from_ymd_opt(2026, 12, 13).unwrap();
        let store = seeded_store(today).await;
        let sender = Arc::new(DryRunSender::new());
        let notifier = notifier(store.clone(), sender.clone(), &[]);

        let first = notifier.run(today).await.unwrap().unwrap();
        let second = notifier.run(today).await.unwrap().unwrap();

        assert_eq!(first.leads[0].sent, 1);
        assert_eq!(first.leads[0].unresolved, 1);
        assert_eq!(first.leads[1].sent, 1);
        assert_eq!(second.leads[0].sent, 0);
        assert_eq!(second.leads[0].already_sent, 1);

        let to_tanaka: Vec<_> = sender
            .sent()
            .await
            .into_iter()
            .filter(|(to, _)| to == "U-tanaka")
            .collect();
        assert_eq!(to_tanaka.len(), 1);
        assert!(to_tanaka[0].1.contains("12月16日(水)11:30〜"));
        assert!(to_tanaka[0].1.contains("カット＋カラー"));

        let logs = store.rows(Table::ReminderLogs).await;
        let tanaka_logs = logs.iter().filter(|r| r["recipient_key"] == "U-tanaka").count();
        assert_eq!(tanaka_logs, 1);
        assert_eq!(logs.len(), 2);
    }

    #[tokio::test]
    async fn next_day_is_a_new_reminder_day() {
        let today = NaiveDate::from_ymd_opt(2026, 12, 13).unwrap();
        let store = seeded_store(today).await;
        store
            .seed(
                Table::ReminderLogs,
                vec![json!({
                    "recipient_key": "U-tanaka", "lead_days": 3, "sent_on": "2026-12-12",
                    "subject_name": "田中", "outcome": "sent", "logged_at": "2026-12-12T00:00:00Z"
                })],
            )
            .await;
        let sender = Arc::new(DryRunSender::new());
        let report = notifier(store, sender, &[]).run(today).await.unwrap().unwrap();
        assert_eq!(report.leads[0].sent, 1);
    }

    struct Refusing;

    #[async_trait]
    impl MessageSender for Refusing {
        async fn push(&self, _recipient: &str, _text: &str) -> Result<(), SendError> {
            Err(SendError::HttpStatus {
                status: 400,
                body: "blocked".into(),
            })
        }
    }

    #[tokio::test]
    async fn failed_send_is_logged_once_and_not_retried_that_day() {
        let today = NaiveDate::from_ymd_opt(2026, 12, 13).unwrap();
        let store = seeded_store(today).await;
        let notifier = notifier(store.clone(), Arc::new(Refusing), &["U-staff"]);

        let first = notifier.run(today).await.unwrap().unwrap();
        assert_eq!(first.leads[0].failed, 1);
        let second = notifier.run(today).await.unwrap().unwrap();
        assert_eq!(second.leads[0].already_sent, 1);

        let logs = store.rows(Table::ReminderLogs).await;
        assert!(logs.iter().all(|r| r["outcome"] == "failed"));
        assert_eq!(logs.len(), 2);
    }

    #[tokio::test]
    async fn staff_get_a_notice_per_successful_send() {
        let today = NaiveDate::from_ymd_opt(2026, 12, 13).unwrap();
        let store = seeded_store(today).await;
        let sender = Arc::new(DryRunSender::new());
        notifier(store, sender.clone(), &["U-staff"]).run(today).await.unwrap().unwrap();

        let notices: Vec<_> = sender
            .sent()
            .await
            .into_iter()
            .filter(|(to, _)| to == "U-staff")
            .collect();
        assert_eq!(notices.len(), 2);
        assert!(notices[0].1.contains("田中様（3日前）"));
    }

    #[tokio::test]
    async fn allow_list_limits_who_is_messaged() {
        let today = NaiveDate::from_ymd_opt(2026, 12, 13).unwrap();
        let store = seeded_store(today).await;
        let sender = Arc::new(DryRunSender::new());
        let settings = ReminderSettings {
            allow_list: vec!["090-1111-2222".into()],
            ..ReminderSettings::default()
        };
        let notifier = ReminderNotifier::new(store, sender.clone(), settings, Vec::new(), fast(), RunGuard::new());

        let report = notifier.run(today).await.unwrap().unwrap();
        assert_eq!(report.leads[0].sent, 1);
        assert_eq!(report.leads[1].not_allowed, 1);
        assert_eq!(sender.sent().await.len(), 1);
    }

    struct SlowSender {
        inner: DryRunSender,
    }

    #[async_trait]
    impl MessageSender for SlowSender {
        async fn push(&self, recipient: &str, text: &str) -> Result<(), SendError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.inner.push(recipient, text).await
        }
    }

    #[tokio::test]
    async fn overlapping_passes_send_each_reminder_once() {
        let today = NaiveDate::from_ymd_opt(2026, 12, 13).unwrap();
        let store = seeded_store(today).await;
        let sender = Arc::new(SlowSender {
            inner: DryRunSender::new(),
        });
        let notifier = notifier(store.clone(), sender.clone(), &[]);

        let (a, b) = tokio::join!(notifier.run(today), notifier.run(today));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.is_some() as u8 + b.is_some() as u8, 1);

        let to_tanaka = sender
            .inner
            .sent()
            .await
            .into_iter()
            .filter(|(to, _)| to == "U-tanaka")
            .count();
        assert_eq!(to_tanaka, 1);
        let logs = store.rows(Table::ReminderLogs).await;
        assert_eq!(logs.iter().filter(|r| r["recipient_key"] == "U-tanaka").count(), 1);

        let later = notifier.run(today).await.unwrap().unwrap();
        assert_eq!(later.leads[0].already_sent, 1);
    }

    /// Memory store whose reminder-log writes can be made to fail.
    struct FlakyLogs {
        inner: MemoryRecordStore,
        fail_insert: bool,
        fail_upsert: bool,
    }

    #[async_trait]
    impl RecordStore for FlakyLogs {
        async fn get(&self, table: Table, filters: &[Filter]) -> Result<Vec<serde_json::Value>, StoreError> {
            self.inner.get(table, filters).await
        }

        async fn insert(&self, table: Table, rows: &[serde_json::Value]) -> Result<(), StoreError> {
            if self.fail_insert && table == Table::ReminderLogs {
                return Err(StoreError::HttpStatus {
                    status: 503,
                    url: "reminder_logs".into(),
                    body: "unavailable".into(),
                });
            }
            self.inner.insert(table, rows).await
        }

        async fn upsert(
            &self,
            table: Table,
            rows: &[serde_json::Value],
            on_conflict: &[&str],
        ) -> Result<(), StoreError> {
            if self.fail_upsert && table == Table::ReminderLogs {
                return Err(StoreError::HttpStatus {
                    status: 503,
                    url: "reminder_logs".into(),
                    body: "unavailable".into(),
                });
            }
            self.inner.upsert(table, rows, on_conflict).await
        }

        async fn delete(&self, table: Table, filters: &[Filter]) -> Result<u64, StoreError> {
            self.inner.delete(table, filters).await
        }
    }

    async fn flaky(today: NaiveDate, fail_insert: bool, fail_upsert: bool) -> Arc<FlakyLogs> {
        let seeded = seeded_store(today).await;
        let inner = MemoryRecordStore::new();
        for table in [Table::Bookings, Table::Customers] {
            inner.seed(table, seeded.rows(table).await).await;
        }
        Arc::new(FlakyLogs {
            inner,
            fail_insert,
            fail_upsert,
        })
    }

    #[tokio::test]
    async fn unwritable_log_means_no_message_at_all() {
        let today = NaiveDate::from_ymd_opt(2026, 12, 13).unwrap();
        let store = flaky(today, true, false).await;
        let sender = Arc::new(DryRunSender::new());
        let notifier = ReminderNotifier::new(
            store,
            sender.clone(),
            ReminderSettings::default(),
            vec!["U-staff".into()],
            fast(),
            RunGuard::new(),
        );

        let first = notifier.run(today).await.unwrap().unwrap();
        let second = notifier.run(today).await.unwrap().unwrap();

        assert_eq!(first.leads[0].sent, 0);
        assert_eq!(first.leads[0].log_failures, 1);
        assert_eq!(second.leads[0].sent, 0);
        assert!(sender.sent().await.is_empty());
    }

    #[tokio::test]
    async fn lost_outcome_update_still_blocks_a_same_day_resend() {
        let today = NaiveDate::from_ymd_opt(2026, 12, 13).unwrap();
        let store = flaky(today, false, true).await;
        let sender = Arc::new(DryRunSender::new());
        let notifier = ReminderNotifier::new(
            store.clone(),
            sender.clone(),
            ReminderSettings::default(),
            Vec::new(),
            fast(),
            RunGuard::new(),
        );

        let first = notifier.run(today).await.unwrap().unwrap();
        assert_eq!(first.leads[0].sent, 1);
        assert_eq!(first.leads[0].log_failures, 1);

        let second = notifier.run(today).await.unwrap().unwrap();
        assert_eq!(second.leads[0].sent, 0);
        assert_eq!(second.leads[0].already_sent, 1);

        let to_tanaka = sender
            .sent()
            .await
            .into_iter()
            .filter(|(to, _)| to == "U-tanaka")
            .count();
        assert_eq!(to_tanaka, 1);
        let logs = store.inner.rows(Table::ReminderLogs).await;
        assert!(logs.iter().all(|r| r["outcome"] == "pending"));
    }
}

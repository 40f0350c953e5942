//! Core booking domain model for RBM.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "rbm-core";

/// Used when upstream does not report how long a booking lasts.
pub const DEFAULT_DURATION_MINUTES: u32 = 60;

/// Channel a booking arrived through upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Booked by a returning customer directly with the shop.
    DirectRepeat,
    /// Booked through a third-party marketplace listing.
    Marketplace,
    Other,
}

impl Channel {
    /// Classify the free-text route label shown next to a booking upstream.
    pub fn from_route_label(label: &str) -> Self {
        let lower = label.to_lowercase();
        if label.contains("次回予約") || lower.contains("repeat") {
            Channel::DirectRepeat
        } else if label.contains("NHPB")
            || label.contains("ホットペッパー")
            || lower.contains("hotpepper")
            || lower.contains("marketplace")
        {
            Channel::Marketplace
        } else {
            Channel::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::DirectRepeat => "direct_repeat",
            Channel::Marketplace => "marketplace",
            Channel::Other => "other",
        }
    }
}

/// Booking tuple as handed over by an extraction adapter, before resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBooking {
    pub booking_id: String,
    pub subject_name: String,
    #[serde(default)]
    pub contact: Option<String>,
    pub scheduled_start: NaiveDateTime,
    #[serde(default)]
    pub staff: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub channel: Option<Channel>,
    #[serde(default)]
    pub duration_minutes: Option<u32>,
}

/// Canonical mirrored booking, one row per upstream booking id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub booking_id: String,
    pub subject_name: String,
    pub contact: Option<String>,
    pub scheduled_start: NaiveDateTime,
    pub staff: Option<String>,
    pub service: Option<String>,
    pub channel: Channel,
    pub duration_minutes: u32,
}

impl Booking {
    pub fn date(&self) -> NaiveDate {
        self.scheduled_start.date()
    }

    /// Missing service or contact marks a record as degraded for the reliability predicate.
    pub fn is_incomplete(&self) -> bool {
        is_blank(self.service.as_deref()) || is_blank(self.contact.as_deref())
    }
}

/// Details remembered from the previous run so detail pages need not be fetched again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedDetail {
    pub service: Option<String>,
    pub contact: Option<String>,
    pub channel: Option<Channel>,
}

/// Customer directory row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub name: String,
    #[serde(default)]
    pub contact: Option<String>,
    /// Messaging id used to reach the customer, if they linked one.
    #[serde(default)]
    pub recipient_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }
}

/// Per-staff availability for one day. Keyed by `(date, staff_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilitySlot {
    pub date: NaiveDate,
    pub staff_id: String,
    pub staff_name: String,
    pub day_off: bool,
    pub open_ranges: Vec<TimeRange>,
}

/// Business day bounds and the grid open ranges snap to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityGrid {
    pub opens_at: NaiveTime,
    pub closes_at: NaiveTime,
    pub granularity_minutes: u32,
}

impl Default for AvailabilityGrid {
    fn default() -> Self {
        Self {
            opens_at: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN),
            closes_at: NaiveTime::from_hms_opt(19, 0, 0).unwrap_or(NaiveTime::MIN),
            granularity_minutes: 10,
        }
    }
}

fn minutes_of(t: NaiveTime) -> u32 {
    t.hour() * 60 + t.minute()
}

fn time_of(minutes: u32) -> Option<NaiveTime> {
    NaiveTime::from_hms_opt(minutes / 60, minutes % 60, 0)
}

/// Gaps between booked intervals inside the business day.
///
/// Gap starts round up and gap ends round down to the grid, so every returned
/// range can actually be offered. The final gap always ends at closing time.
pub fn open_ranges(grid: &AvailabilityGrid, booked: &[TimeRange]) -> Vec<TimeRange> {
    let step = grid.granularity_minutes.max(1);
    let round_up = |m: u32| m.div_ceil(step) * step;
    let round_down = |m: u32| (m / step) * step;
    let close = minutes_of(grid.closes_at);

    let mut sorted = booked.to_vec();
    sorted.sort();

    let mut out = Vec::new();
    let mut current = minutes_of(grid.opens_at);
    for slot in &sorted {
        let slot_start = minutes_of(slot.start).min(close);
        if slot_start > current {
            let start = round_up(current);
            let end = round_down(slot_start);
            if end > start {
                if let (Some(s), Some(e)) = (time_of(start), time_of(end)) {
                    out.push(TimeRange::new(s, e));
                }
            }
        }
        current = current.max(minutes_of(slot.end));
    }
    if current < close {
        let start = round_up(current);
        if close > start {
            if let Some(s) = time_of(start) {
                out.push(TimeRange::new(s, grid.closes_at));
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderOutcome {
    /// Claimed before the push. Stays pending if the final outcome could not be recorded.
    Pending,
    Sent,
    Failed,
}

/// Record of one reminder send attempt, keyed by recipient, lead time and day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderLog {
    pub recipient_key: String,
    pub lead_days: u32,
    pub sent_on: NaiveDate,
    pub subject_name: String,
    pub outcome: ReminderOutcome,
    pub logged_at: DateTime<Utc>,
}

/// Opaque upstream session secret.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionCredential(pub String);

impl std::fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionCredential(<redacted>)")
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.map(|v| v.trim().is_empty()).unwrap_or(true)
}

static DECORATIONS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[★☆♪♡⭐🦁\u{FE0F}]+").expect("valid decoration regex"));
static TRAILING_COPULA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:です|でーす)[。.]*$").expect("valid copula regex"));
static TRAILING_GREETING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:よろしく|お願い|初めまして|はじめまして|こんにちは|こんばんは|おはよう).*$")
        .expect("valid greeting regex")
});
static TRAILING_PUNCTUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[。、.!！?？]+$").expect("valid punctuation regex"));
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\s\u{3000}]+").expect("valid whitespace regex"));

/// Normalize a free-text subject name as typed by customers upstream.
///
/// Keeps only the first line, drops decorative marks and trailing greetings or
/// apologies. Whitespace is removed entirely rather than collapsed to one space:
/// upstream renders the same customer as `田中 太郎` and `田中太郎`, and both
/// must normalize to the same key.
pub fn normalize_subject_name(raw: &str) -> String {
    let first_line = raw.split('\n').next().unwrap_or_default();
    let mut name = DECORATIONS.replace_all(first_line, "").into_owned();
    name = WHITESPACE.replace_all(&name, "").into_owned();
    loop {
        let before = name.clone();
        name = TRAILING_GREETING.replace(&name, "").into_owned();
        name = TRAILING_COPULA.replace(&name, "").into_owned();
        name = TRAILING_PUNCTUATION.replace(&name, "").into_owned();
        if name == before {
            break;
        }
    }
    name.trim().to_string()
}

/// Digits-only contact number, or `None` when nothing usable remains.
pub fn normalize_contact(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn name_normalization_drops_second_line_and_marks() {
        assert_eq!(normalize_subject_name("田中★\nID12345"), "田中");
    }

    #[test]
    fn name_normalization_strips_trailing_copula() {
        assert_eq!(normalize_subject_name("鈴木です。"), "鈴木");
    }

    #[test]
    fn name_normalization_strips_greetings_and_spaces() {
        assert_eq!(normalize_subject_name("山田　花子 よろしくお願いします！"), "山田花子");
        assert_eq!(normalize_subject_name("佐藤です！はじめまして"), "佐藤");
        assert_eq!(normalize_subject_name("  ☆伊藤♪  "), "伊藤");
    }

    #[test]
    fn spaced_and_unspaced_names_share_one_key() {
        assert_eq!(normalize_subject_name("田中 太郎"), normalize_subject_name("田中太郎"));
        assert_eq!(normalize_subject_name("田中\u{3000}太郎"), "田中太郎");
    }

    #[test]
    fn contact_normalization_keeps_digits() {
        assert_eq!(normalize_contact("090-1234-5678").as_deref(), Some("09012345678"));
        assert_eq!(normalize_contact(" - "), None);
    }

    #[test]
    fn route_labels_map_to_channels() {
        assert_eq!(Channel::from_route_label("次回予約"), Channel::DirectRepeat);
        assert_eq!(Channel::from_route_label("NHPB(ホットペッパー)"), Channel::Marketplace);
        assert_eq!(Channel::from_route_label("電話"), Channel::Other);
    }

    #[test]
    fn open_ranges_fill_gaps_on_the_grid() {
        let grid = AvailabilityGrid::default();
        let booked = vec![
            TimeRange::new(t(13, 5), t(14, 0)),
            TimeRange::new(t(10, 0), t(11, 15)),
        ];
        let open = open_ranges(&grid, &booked);
        assert_eq!(
            open,
            vec![
                TimeRange::new(t(9, 0), t(10, 0)),
                TimeRange::new(t(11, 20), t(13, 0)),
                TimeRange::new(t(14, 0), t(19, 0)),
            ]
        );
    }

    #[test]
    fn open_ranges_empty_when_fully_booked() {
        let grid = AvailabilityGrid::default();
        let booked = vec![TimeRange::new(t(9, 0), t(19, 0))];
        assert!(open_ranges(&grid, &booked).is_empty());
    }

    #[test]
    fn incomplete_bookings_are_detected() {
        let booking = Booking {
            booking_id: "BE1".into(),
            subject_name: "田中".into(),
            contact: Some("09012345678".into()),
            scheduled_start: NaiveDate::from_ymd_opt(2026, 10, 20)
                .unwrap()
                .and_time(t(11, 30)),
            staff: None,
            service: Some("  ".into()),
            channel: Channel::Marketplace,
            duration_minutes: DEFAULT_DURATION_MINUTES,
        };
        assert!(booking.is_incomplete());
    }

    #[test]
    fn credential_debug_is_redacted() {
        let cred = SessionCredential("secret-cookie".into());
        assert!(!format!("{cred:?}").contains("secret"));
        assert_eq!(serde_json::to_string(&cred).unwrap(), "\"secret-cookie\"");
    }
}

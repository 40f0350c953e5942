use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono_tz::Tz;
use rbm_core::AvailabilityGrid;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_TIMEZONE: Tz = chrono_tz::Asia::Tokyo;

/// Process-level settings read from the environment.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base address of the hosted Record Store. `None` runs against the in-memory store.
    pub store_url: Option<String>,
    pub store_key: Option<String>,
    pub fixtures_dir: PathBuf,
    pub credential_path: PathBuf,
    pub workers: usize,
    pub timezone: Tz,
    pub scheduler_enabled: bool,
    pub cron_fast: String,
    pub cron_full: String,
    pub cron_reminders: String,
    pub push_url: String,
    pub push_token: Option<String>,
    pub alert_recipient: Option<String>,
    pub dry_run: bool,
    pub settings_path: Option<PathBuf>,
    pub bind: String,
    pub http_timeout_secs: u64,
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let timezone = match env_opt("RBM_TIMEZONE") {
            Some(raw) => raw.parse::<Tz>().unwrap_or_else(|_| {
                warn!(value = %raw, "unknown RBM_TIMEZONE, falling back to Asia/Tokyo");
                DEFAULT_TIMEZONE
            }),
            None => DEFAULT_TIMEZONE,
        };
        Self {
            store_url: env_opt("RBM_STORE_URL"),
            store_key: env_opt("RBM_STORE_KEY"),
            fixtures_dir: std::env::var("RBM_FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./fixtures/upstream")),
            credential_path: std::env::var("RBM_CREDENTIAL_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./state/session.json")),
            workers: std::env::var("RBM_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|w: &usize| *w > 0)
                .unwrap_or(6),
            timezone,
            scheduler_enabled: env_flag("RBM_SCHEDULER_ENABLED"),
            cron_fast: std::env::var("RBM_CRON_FAST").unwrap_or_else(|_| "0 * * * * *".to_string()),
            cron_full: std::env::var("RBM_CRON_FULL").unwrap_or_else(|_| "30 */5 * * * *".to_string()),
            // 09:00 in Asia/Tokyo; job schedules are evaluated in UTC.
            cron_reminders: std::env::var("RBM_CRON_REMINDERS")
                .unwrap_or_else(|_| "0 0 0 * * *".to_string()),
            push_url: std::env::var("RBM_PUSH_URL")
                .unwrap_or_else(|_| "https://api.line.me/v2/bot/message/push".to_string()),
            push_token: env_opt("RBM_PUSH_TOKEN"),
            alert_recipient: env_opt("RBM_ALERT_RECIPIENT"),
            dry_run: env_flag("RBM_DRY_RUN"),
            settings_path: env_opt("RBM_SETTINGS").map(PathBuf::from),
            bind: std::env::var("RBM_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
            http_timeout_secs: std::env::var("RBM_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilityThresholds {
    pub min_fetched: usize,
    /// Fraction of fetched bookings allowed to lack service or contact.
    pub max_incomplete_ratio: f64,
}

impl Default for ReliabilityThresholds {
    fn default() -> Self {
        Self {
            min_fetched: 200,
            max_incomplete_ratio: 0.05,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Horizons {
    pub fast_days: u32,
    pub full_days: u32,
}

impl Default for Horizons {
    fn default() -> Self {
        Self {
            fast_days: 14,
            full_days: 56,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReminderSettings {
    pub lead_days: Vec<u32>,
    /// Message body per lead time. Placeholders: `{name}`, `{when}`, `{service}`.
    pub templates: BTreeMap<u32, String>,
    /// When non-empty, only these contact numbers are messaged.
    pub allow_list: Vec<String>,
}

const THREE_DAY_TEMPLATE: &str = "{name} 様\n\nご予約【3日前】のお知らせ🕊️\n{when}\n{service}\n\n\
ご予約日の変更・キャンセルはお早めにご連絡ください。";
const SEVEN_DAY_TEMPLATE: &str = "{name} 様\nご予約日の【7日前】となりました🕊️\n{when}\n{service}\n\n\
ご予約日延期は、お早めにご協力をお願いします✨";

impl Default for ReminderSettings {
    fn default() -> Self {
        Self {
            lead_days: vec![3, 7],
            templates: BTreeMap::from([
                (3, THREE_DAY_TEMPLATE.to_string()),
                (7, SEVEN_DAY_TEMPLATE.to_string()),
            ]),
            allow_list: Vec::new(),
        }
    }
}

/// Tunables loaded from the YAML settings file. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub reliability: ReliabilityThresholds,
    pub failure_threshold: u32,
    pub horizons: Horizons,
    pub reminders: ReminderSettings,
    /// Messaging ids of staff who get operational notices.
    pub staff_recipients: Vec<String>,
    pub grid: AvailabilityGrid,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            reliability: ReliabilityThresholds::default(),
            failure_threshold: 5,
            horizons: Horizons::default(),
            reminders: ReminderSettings::default(),
            staff_recipients: Vec::new(),
            grid: AvailabilityGrid::default(),
        }
    }
}

impl Settings {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).context("parsing settings yaml")
    }

    /// Read settings from `path`, or defaults when no path is configured.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }
}

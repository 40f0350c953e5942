//! Reconciliation engine for the rolling booking mirror.

pub mod config;
pub mod engine;
pub mod monitor;
pub mod mutation;
pub mod notify;
pub mod partition;
pub mod prune;
pub mod reconcile;
pub mod reminder;
pub mod resolve;
pub mod schedule;

use chrono::{NaiveDate, Utc};
use chrono_tz::Tz;
use serde::Serialize;

pub use config::{Settings, SyncConfig};
pub use engine::Engine;
pub use monitor::{EngineState, EngineStatus, FailureMonitor, RunGuard};
pub use mutation::{MutationOutcome, MutationRequest, MutationRunner};
pub use notify::{send_with_retry, DryRunSender, MessageSender, PushApiSender, SendError};
pub use partition::{partition_horizon, WorkerContext};
pub use reconcile::{validate_days, Reconciler, RunReport, RunStatus};
pub use reminder::{ReminderNotifier, ReminderReport};
pub use resolve::{resolve, Resolution};
pub use schedule::build_scheduler;

pub const CRATE_NAME: &str = "rbm-sync";

/// Answer to an external trigger while another unit may be in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOutcome {
    Accepted,
    Rejected,
}

/// Today's date in the business time zone.
pub fn business_today(timezone: Tz) -> NaiveDate {
    Utc::now().with_timezone(&timezone).date_naive()
}

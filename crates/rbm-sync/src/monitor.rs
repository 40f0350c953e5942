use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::reconcile::RunReport;

/// Consecutive failed-run counter with a one-shot alert.
///
/// Armed until the failure that reaches `threshold`, Fired until the next success.
#[derive(Debug)]
pub struct FailureMonitor {
    threshold: u32,
    consecutive: AtomicU32,
    fired: AtomicBool,
}

impl FailureMonitor {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: AtomicU32::new(0),
            fired: AtomicBool::new(false),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Count a failed run. Returns `true` exactly once per armed period: on the
    /// failure that brings the counter to the threshold.
    pub fn record_failure(&self) -> bool {
        let count = self.consecutive.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        count == self.threshold
            && self
                .fired
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    pub fn record_success(&self) {
        self.consecutive.store(0, Ordering::SeqCst);
        self.fired.store(false, Ordering::SeqCst);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive.load(Ordering::SeqCst)
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// Single-in-flight flag. Holding a [`RunPermit`] means the slot is taken.
#[derive(Debug, Clone, Default)]
pub struct RunGuard {
    running: Arc<AtomicBool>,
}

impl RunGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Option<RunPermit> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunPermit {
                running: self.running.clone(),
            })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Clears its guard when dropped, including on early return or panic unwind.
#[derive(Debug)]
pub struct RunPermit {
    running: Arc<AtomicBool>,
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Process-scoped mutable state of the engine, injected into every component that needs it.
#[derive(Debug)]
pub struct EngineState {
    pub failures: FailureMonitor,
    pub reconcile_guard: RunGuard,
    pub mutation_guard: RunGuard,
    pub reminder_guard: RunGuard,
    last_report: RwLock<Option<RunReport>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub reconcile_running: bool,
    pub mutation_running: bool,
    pub reminder_running: bool,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub alert_fired: bool,
    pub last_run: Option<RunReport>,
}

impl EngineState {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            failures: FailureMonitor::new(failure_threshold),
            reconcile_guard: RunGuard::new(),
            mutation_guard: RunGuard::new(),
            reminder_guard: RunGuard::new(),
            last_report: RwLock::new(None),
        }
    }

    pub async fn record_report(&self, report: RunReport) {
        *self.last_report.write().await = Some(report);
    }

    pub async fn status(&self) -> EngineStatus {
        EngineStatus {
            reconcile_running: self.reconcile_guard.is_running(),
            mutation_running: self.mutation_guard.is_running(),
            reminder_running: self.reminder_guard.is_running(),
            consecutive_failures: self.failures.consecutive_failures(),
            failure_threshold: self.failures.threshold(),
            alert_fired: self.failures.is_fired(),
            last_run: self.last_report.read().await.clone(),
        }
    }
}

//! User-triggered cancel/reschedule pushed to upstream, one at a time.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use rbm_adapters::{AdapterError, Session, SessionProvider, UpstreamMutator};
use rbm_core::Booking;
use rbm_storage::{delete_booking, find_booking, upsert_bookings, BackoffPolicy, CredentialStore, RecordStore};
use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span, warn, Instrument};

use crate::monitor::{EngineState, RunPermit};
use crate::notify::{send_best_effort, MessageSender};
use crate::partition::{acquire_session, fresh_login};
use crate::reminder::format_visit;
use crate::TriggerOutcome;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MutationRequest {
    Cancel {
        booking_id: String,
        #[serde(default)]
        notify_recipient: Option<String>,
    },
    Reschedule {
        booking_id: String,
        new_start: NaiveDateTime,
        #[serde(default)]
        notify_recipient: Option<String>,
    },
}

impl MutationRequest {
    pub fn booking_id(&self) -> &str {
        match self {
            MutationRequest::Cancel { booking_id, .. } | MutationRequest::Reschedule { booking_id, .. } => {
                booking_id
            }
        }
    }

    fn notify_recipient(&self) -> Option<&str> {
        match self {
            MutationRequest::Cancel { notify_recipient, .. }
            | MutationRequest::Reschedule { notify_recipient, .. } => notify_recipient.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MutationOutcome {
    pub booking_id: String,
    pub upstream_applied: bool,
    pub local_rows_changed: u64,
    pub error: Option<String>,
}

pub struct MutationRunner {
    mutator: Arc<dyn UpstreamMutator>,
    sessions: Arc<dyn SessionProvider>,
    credentials: Arc<CredentialStore>,
    store: Arc<dyn RecordStore>,
    sender: Arc<dyn MessageSender>,
    staff_recipients: Vec<String>,
    retry: BackoffPolicy,
    state: Arc<EngineState>,
}

impl MutationRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mutator: Arc<dyn UpstreamMutator>,
        sessions: Arc<dyn SessionProvider>,
        credentials: Arc<CredentialStore>,
        store: Arc<dyn RecordStore>,
        sender: Arc<dyn MessageSender>,
        staff_recipients: Vec<String>,
        retry: BackoffPolicy,
        state: Arc<EngineState>,
    ) -> Self {
        Self {
            mutator,
            sessions,
            credentials,
            store,
            sender,
            staff_recipients,
            retry,
            state,
        }
    }

    /// Start the mutation in the background unless another one is in flight.
    pub fn trigger(self: &Arc<Self>, request: MutationRequest) -> TriggerOutcome {
        let Some(permit) = self.state.mutation_guard.try_acquire() else {
            warn!(booking_id = request.booking_id(), "mutation already in flight, rejecting");
            return TriggerOutcome::Rejected;
        };
        let runner = Arc::clone(self);
        let span = info_span!("upstream_mutation", booking_id = request.booking_id());
        tokio::spawn(
            async move {
                runner.execute_with_permit(permit, request).await;
            }
            .instrument(span),
        );
        TriggerOutcome::Accepted
    }

    /// Run a mutation in the foreground, still honoring the single-in-flight guard.
    pub async fn run_exclusive(&self, request: MutationRequest) -> Option<MutationOutcome> {
        let permit = self.state.mutation_guard.try_acquire()?;
        Some(self.execute_with_permit(permit, request).await)
    }

    async fn execute_with_permit(&self, _permit: RunPermit, request: MutationRequest) -> MutationOutcome {
        match self.execute(&request).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(error = %format!("{err:#}"), "upstream mutation failed");
                MutationOutcome {
                    booking_id: request.booking_id().to_string(),
                    upstream_applied: false,
                    local_rows_changed: 0,
                    error: Some(format!("{err:#}")),
                }
            }
        }
    }

    async fn apply_upstream(&self, request: &MutationRequest, session: &Session) -> Result<(), AdapterError> {
        match request {
            MutationRequest::Cancel { booking_id, .. } => self.mutator.cancel(booking_id, session).await,
            MutationRequest::Reschedule {
                booking_id, new_start, ..
            } => self.mutator.reschedule(booking_id, *new_start, session).await,
        }
    }

    async fn execute(&self, request: &MutationRequest) -> Result<MutationOutcome> {
        let booking_id = request.booking_id();
        let local = find_booking(self.store.as_ref(), booking_id)
            .await
            .context("looking up local booking")?;

        let session = acquire_session(self.sessions.as_ref(), &self.credentials)
            .await
            .context("establishing upstream session")?;
        let mut applied = self.apply_upstream(request, &session).await;
        if matches!(applied, Err(AdapterError::SessionExpired)) {
            let session = fresh_login(self.sessions.as_ref(), &self.credentials)
                .await
                .context("re-establishing upstream session")?;
            applied = self.apply_upstream(request, &session).await;
        }

        let mut outcome = MutationOutcome {
            booking_id: booking_id.to_string(),
            upstream_applied: applied.is_ok(),
            local_rows_changed: 0,
            error: applied.as_ref().err().map(|e| e.to_string()),
        };
        if let Err(err) = &applied {
            warn!(error = %err, "upstream rejected the mutation");
        } else {
            outcome.local_rows_changed = self.apply_locally(request, local.as_ref()).await?;
        }

        self.notify(request, local.as_ref(), outcome.upstream_applied).await;
        info!(applied = outcome.upstream_applied, rows = outcome.local_rows_changed, "mutation finished");
        Ok(outcome)
    }

    async fn apply_locally(&self, request: &MutationRequest, local: Option<&Booking>) -> Result<u64> {
        match request {
            MutationRequest::Cancel { booking_id, .. } => delete_booking(self.store.as_ref(), booking_id)
                .await
                .context("deleting cancelled booking"),
            MutationRequest::Reschedule { new_start, .. } => {
                let Some(booking) = local else {
                    return Ok(0);
                };
                let moved = Booking {
                    scheduled_start: *new_start,
                    ..booking.clone()
                };
                let written = upsert_bookings(self.store.as_ref(), std::slice::from_ref(&moved))
                    .await
                    .context("moving rescheduled booking")?;
                Ok(written as u64)
            }
        }
    }

    async fn notify(&self, request: &MutationRequest, local: Option<&Booking>, applied: bool) {
        let name = local.map(|b| b.subject_name.as_str()).unwrap_or("不明");
        let when = local.map(|b| format_visit(b.scheduled_start)).unwrap_or_default();
        let service = local.and_then(|b| b.service.as_deref()).unwrap_or_default();
        let staff = local.and_then(|b| b.staff.as_deref()).unwrap_or_default();

        let (staff_text, customer_text) = match request {
            MutationRequest::Cancel { .. } => {
                let status = if applied {
                    "キャンセル完了"
                } else {
                    "キャンセル依頼（手動対応必要）"
                };
                (
                    format!("[{status}]\nお客様：{name}\n日時：{when}\nメニュー：{service}\nスタッフ：{staff}"),
                    format!("予約をキャンセルしました。\n\n日時：{when}\nメニュー：{service}\n\nまたのご予約お待ちしております。"),
                )
            }
            MutationRequest::Reschedule { new_start, .. } => {
                let after = format_visit(*new_start);
                let status = if applied { "予約変更通知" } else { "予約変更依頼（手動対応必要）" };
                (
                    format!("【{status}】\nお客様: {name}\n変更前: {when}\n変更後: {after}\n担当: {staff}"),
                    format!("ご予約を変更しました。\n\n変更後：{after}\nメニュー：{service}"),
                )
            }
        };

        for recipient in &self.staff_recipients {
            send_best_effort(self.sender.as_ref(), recipient, &staff_text, &self.retry).await;
        }
        if applied {
            if let Some(customer) = request.notify_recipient() {
                send_best_effort(self.sender.as_ref(), customer, &customer_text, &self.retry).await;
            }
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rbm_adapters::{FixtureExtractionAdapter, FixtureSessionProvider};
use rbm_storage::{BackoffPolicy, CredentialStore, MemoryRecordStore, RecordStore, RestRecordStore};
use tracing::{info, warn};

use crate::config::{Settings, SyncConfig};
use crate::monitor::EngineState;
use crate::mutation::MutationRunner;
use crate::notify::{message_backoff, DryRunSender, MessageSender, PushApiSender};
use crate::partition::WorkerContext;
use crate::reconcile::{Reconciler, ReconcilerOptions};
use crate::reminder::ReminderNotifier;

/// Fully wired engine: one shared state, store and sender behind every entry point.
#[derive(Clone)]
pub struct Engine {
    pub config: SyncConfig,
    pub settings: Settings,
    pub state: Arc<EngineState>,
    pub store: Arc<dyn RecordStore>,
    pub reconciler: Arc<Reconciler>,
    pub reminders: Arc<ReminderNotifier>,
    pub mutations: Arc<MutationRunner>,
}

impl Engine {
    pub fn build(config: SyncConfig, settings: Settings, store: Arc<dyn RecordStore>) -> Result<Self> {
        let sender: Arc<dyn MessageSender> = match (&config.push_token, config.dry_run) {
            (Some(token), false) => Arc::new(PushApiSender::new(
                config.push_url.clone(),
                token.clone(),
                Duration::from_secs(config.http_timeout_secs),
            )?),
            (None, false) => {
                warn!("RBM_PUSH_TOKEN is not set, messages will only be logged");
                Arc::new(DryRunSender::new())
            }
            (_, true) => Arc::new(DryRunSender::new()),
        };
        Self::with_sender(config, settings, store, sender)
    }

    pub fn with_sender(
        config: SyncConfig,
        settings: Settings,
        store: Arc<dyn RecordStore>,
        sender: Arc<dyn MessageSender>,
    ) -> Result<Self> {
        let state = Arc::new(EngineState::new(settings.failure_threshold));
        let credentials = Arc::new(CredentialStore::new(config.credential_path.clone()));
        let upstream = Arc::new(FixtureExtractionAdapter::new(config.fixtures_dir.clone(), settings.grid));
        let sessions = Arc::new(FixtureSessionProvider::new(credentials.clone()));
        let retry = message_backoff();

        let reconciler = Arc::new(Reconciler::new(
            WorkerContext {
                adapter: upstream.clone(),
                sessions: sessions.clone(),
                credentials: credentials.clone(),
            },
            store.clone(),
            sender.clone(),
            state.clone(),
            ReconcilerOptions {
                workers: config.workers,
                timezone: config.timezone,
                reliability: settings.reliability,
                alert_recipient: config.alert_recipient.clone(),
                retry,
            },
        ));
        let reminders = Arc::new(ReminderNotifier::new(
            store.clone(),
            sender.clone(),
            settings.reminders.clone(),
            settings.staff_recipients.clone(),
            retry,
            state.reminder_guard.clone(),
        ));
        let mutations = Arc::new(MutationRunner::new(
            upstream,
            sessions,
            credentials,
            store.clone(),
            sender,
            settings.staff_recipients.clone(),
            retry,
            state.clone(),
        ));

        Ok(Self {
            config,
            settings,
            state,
            store,
            reconciler,
            reminders,
            mutations,
        })
    }

    /// Wire everything from environment configuration and the settings file.
    pub async fn from_env(force_memory_store: bool) -> Result<Self> {
        let config = SyncConfig::from_env();
        let settings = Settings::load(config.settings_path.as_deref()).await?;
        let store: Arc<dyn RecordStore> = match (&config.store_url, force_memory_store) {
            (Some(url), false) => {
                info!(%url, "using hosted record store");
                Arc::new(RestRecordStore::new(
                    url.clone(),
                    config.store_key.clone(),
                    Duration::from_secs(config.http_timeout_secs),
                    BackoffPolicy::default(),
                )?)
            }
            _ => {
                info!("using in-memory record store");
                Arc::new(MemoryRecordStore::new())
            }
        };
        Self::build(config, settings, store)
    }
}

//! Axum trigger surface for the RBM reconciliation engine.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDateTime;
use rbm_sync::{business_today, validate_days, Engine, MutationRequest, TriggerOutcome};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "rbm-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

#[derive(Debug, Deserialize)]
struct ReconcileParams {
    days_limit: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct CancelBody {
    #[serde(default)]
    notify_recipient: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RescheduleBody {
    new_start: NaiveDateTime,
    #[serde(default)]
    notify_recipient: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health_check", get(health_check_handler))
        .route("/api/status", get(status_handler))
        .route("/api/reconcile", post(reconcile_handler))
        .route("/api/reminders/run", post(reminders_handler))
        .route("/api/bookings/{id}/cancel", post(cancel_handler))
        .route("/api/bookings/{id}/reschedule", post(reschedule_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(engine: Engine) -> anyhow::Result<()> {
    let bind = engine.config.bind.clone();
    let listener = TcpListener::bind(&bind).await?;
    info!(%bind, "trigger surface listening");
    axum::serve(listener, app(AppState::new(engine))).await?;
    Ok(())
}

/// Serve with the store selected by `RBM_STORE_URL`, plus the cron jobs when enabled.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let engine = Engine::from_env(false).await?;
    let scheduler = rbm_sync::build_scheduler(&engine).await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await?;
    }
    serve(engine).await
}

async fn health_check_handler() -> &'static str {
    "ok"
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.engine.state.status().await).into_response()
}

async fn reconcile_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ReconcileParams>,
) -> Response {
    let horizons = state.engine.settings.horizons;
    let requested = params.days_limit.unwrap_or(horizons.fast_days);
    let days = match validate_days(requested, horizons.full_days) {
        Ok(days) => days,
        Err(err) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": err.to_string() }))).into_response(),
    };
    trigger_response(state.engine.reconciler.trigger(days), json!({ "days": days }))
}

async fn reminders_handler(State(state): State<Arc<AppState>>) -> Response {
    let today = business_today(state.engine.config.timezone);
    match state.engine.reminders.run(today).await {
        Ok(Some(report)) => Json(report).into_response(),
        Ok(None) => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "status": TriggerOutcome::Rejected })),
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<CancelBody>,
) -> Response {
    let request = MutationRequest::Cancel {
        booking_id: id.clone(),
        notify_recipient: body.notify_recipient,
    };
    trigger_response(state.engine.mutations.trigger(request), json!({ "booking_id": id }))
}

async fn reschedule_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<RescheduleBody>,
) -> Response {
    let request = MutationRequest::Reschedule {
        booking_id: id.clone(),
        new_start: body.new_start,
        notify_recipient: body.notify_recipient,
    };
    trigger_response(
        state.engine.mutations.trigger(request),
        json!({ "booking_id": id, "new_start": body.new_start }),
    )
}

fn trigger_response(outcome: TriggerOutcome, mut detail: serde_json::Value) -> Response {
    let status = match outcome {
        TriggerOutcome::Accepted => StatusCode::ACCEPTED,
        TriggerOutcome::Rejected => StatusCode::TOO_MANY_REQUESTS,
    };
    if let Some(fields) = detail.as_object_mut() {
        fields.insert("status".into(), json!(outcome));
    }
    (status, Json(detail)).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use rbm_storage::MemoryRecordStore;
    use rbm_sync::{DryRunSender, Settings, SyncConfig};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn engine() -> (Engine, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SyncConfig::from_env();
        config.fixtures_dir = dir.path().join("upstream");
        config.credential_path = dir.path().join("session.json");
        let engine = Engine::with_sender(
            config,
            Settings::default(),
            Arc::new(MemoryRecordStore::new()),
            Arc::new(DryRunSender::new()),
        )
        .unwrap();
        (engine, dir)
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_check_answers_ok() {
        let (engine, _dir) = engine();
        let resp = app(AppState::new(engine))
            .oneshot(Request::builder().uri("/health_check").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn reconcile_is_accepted_then_rejected_while_running() {
        let (engine, _dir) = engine();
        let app = app(AppState::new(engine.clone()));

        let resp = app
            .clone()
            .oneshot(post("/api/reconcile?days_limit=14", ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(json_body(resp).await["days"], 14);

        let _held = loop {
            if let Some(permit) = engine.state.reconcile_guard.try_acquire() {
                break permit;
            }
            tokio::task::yield_now().await;
        };
        let resp = app.oneshot(post("/api/reconcile", "")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(json_body(resp).await["status"], "rejected");
    }

    #[tokio::test]
    async fn reconcile_rejects_out_of_range_horizon() {
        let (engine, _dir) = engine();
        let resp = app(AppState::new(engine))
            .oneshot(post("/api/reconcile?days_limit=0", ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn status_reports_guards_and_failures() {
        let (engine, _dir) = engine();
        let _mutation = engine.state.mutation_guard.try_acquire().unwrap();
        let resp = app(AppState::new(engine))
            .oneshot(Request::builder().uri("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["mutation_running"], true);
        assert_eq!(body["reconcile_running"], false);
        assert_eq!(body["consecutive_failures"], 0);
        assert_eq!(body["failure_threshold"], 5);
    }

    #[tokio::test]
    async fn cancel_respects_the_mutation_guard() {
        let (engine, _dir) = engine();
        let app = app(AppState::new(engine.clone()));

        let held = engine.state.mutation_guard.try_acquire().unwrap();
        let resp = app
            .clone()
            .oneshot(post("/api/bookings/BE1/cancel", "{}"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        drop(held);

        let resp = app
            .oneshot(post("/api/bookings/BE1/cancel", r#"{"notify_recipient":"U1"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(json_body(resp).await["booking_id"], "BE1");
    }

    #[tokio::test]
    async fn reschedule_needs_a_new_start() {
        let (engine, _dir) = engine();
        let app = app(AppState::new(engine));

        let resp = app
            .clone()
            .oneshot(post("/api/bookings/BE1/reschedule", "{}"))
            .await
            .unwrap();
        assert!(resp.status().is_client_error());

        let resp = app
            .oneshot(post(
                "/api/bookings/BE1/reschedule",
                r#"{"new_start":"2026-12-18T15:00:00"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn reminder_run_returns_per_lead_report() {
        let (engine, _dir) = engine();
        let resp = app(AppState::new(engine))
            .oneshot(post("/api/reminders/run", ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["leads"].as_array().unwrap().len(), 2);
        assert_eq!(body["leads"][0]["lead_days"], 3);
    }

    #[tokio::test]
    async fn reminder_run_is_rejected_while_a_pass_is_running() {
        let (engine, _dir) = engine();
        let _held = engine.state.reminder_guard.try_acquire().unwrap();
        let resp = app(AppState::new(engine))
            .oneshot(post("/api/reminders/run", ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(json_body(resp).await["status"], "rejected");
    }
}

//! Push-notification receiver: the CRM posts a changed deal id, we re-sync that deal.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dealsync_core::DealId;
use dealsync_storage::SelectError;
use dealsync_sync::{DealUpdater, SingleDealOutcome, SyncConfig, SyncError};
use serde_json::{json, Value};
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "dealsync-web";

pub const WEBHOOK_PATH: &str = "/bitrix-webhook";

/// Form keys, in lookup order, that may carry the changed deal id.
const FORM_ID_KEYS: &[&str] = &["data[FIELDS][ID]", "ID", "id"];
const FORM_TOKEN_KEY: &str = "auth[application_token]";

/// What to do when the CRM reports a changed deal.
#[async_trait]
pub trait PushHandler: Send + Sync {
    async fn deal_changed(
        &self,
        id: DealId,
        cancel: &CancellationToken,
    ) -> Result<SingleDealOutcome, SyncError>;
}

#[async_trait]
impl PushHandler for DealUpdater {
    async fn deal_changed(
        &self,
        id: DealId,
        cancel: &CancellationToken,
    ) -> Result<SingleDealOutcome, SyncError> {
        self.sync_deal(id, cancel).await
    }
}

#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<dyn PushHandler>,
    /// Expected `auth[application_token]`; unchecked when `None`.
    pub token: Option<String>,
    pub cancel: CancellationToken,
}

impl AppState {
    pub fn new(handler: Arc<dyn PushHandler>) -> Self {
        Self {
            handler,
            token: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Decoded notification body.
#[derive(Debug, Clone, PartialEq)]
pub enum PushPayload {
    Form(Vec<(String, String)>),
    Json(Value),
}

impl PushPayload {
    /// JSON when the content type says so or the body looks like an object; form otherwise.
    pub fn parse(content_type: Option<&str>, body: &[u8]) -> Self {
        let declared_json = content_type.is_some_and(|ct| ct.contains("json"));
        let looks_json = body.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'{');
        if declared_json || looks_json {
            if let Ok(value) = serde_json::from_slice(body) {
                return PushPayload::Json(value);
            }
        }
        PushPayload::Form(url::form_urlencoded::parse(body).into_owned().collect())
    }

    pub fn deal_id(&self) -> Option<DealId> {
        match self {
            PushPayload::Form(pairs) => FORM_ID_KEYS.iter().find_map(|key| {
                pairs
                    .iter()
                    .find(|(k, _)| k == key)
                    .and_then(|(_, v)| v.trim().parse().ok())
            }),
            PushPayload::Json(value) => [
                &["data", "FIELDS", "ID"][..],
                &["FIELDS", "ID"],
                &["ID"],
                &["id"],
            ]
            .iter()
            .find_map(|path| json_path(value, path).and_then(json_id)),
        }
    }

    pub fn application_token(&self) -> Option<&str> {
        match self {
            PushPayload::Form(pairs) => pairs
                .iter()
                .find(|(k, _)| k == FORM_TOKEN_KEY)
                .map(|(_, v)| v.as_str()),
            PushPayload::Json(value) => {
                json_path(value, &["auth", "application_token"]).and_then(Value::as_str)
            }
        }
    }
}

fn json_path<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, key| current.get(*key))
}

fn json_id(value: &Value) -> Option<DealId> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route(WEBHOOK_PATH, post(webhook_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
}

async fn healthz_handler() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({"error": message.into()}))).into_response()
}

async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let payload = PushPayload::parse(content_type, &body);

    if let Some(expected) = &state.token {
        if payload.application_token() != Some(expected.as_str()) {
            warn!("push notification rejected: application token mismatch");
            return error_response(StatusCode::UNAUTHORIZED, "invalid application token");
        }
    }

    let Some(id) = payload.deal_id() else {
        warn!("push notification without a deal id");
        return error_response(StatusCode::BAD_REQUEST, "no deal id in payload");
    };

    match state.handler.deal_changed(id, &state.cancel).await {
        Ok(SingleDealOutcome::Synced(_)) => Json(json!({"status": "synced", "id": id})).into_response(),
        Ok(SingleDealOutcome::Missing) => Json(json!({"status": "missing", "id": id})).into_response(),
        Err(err) if err.is_cancelled() => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "shutting down")
        }
        Err(err @ SyncError::Fetch(SelectError::Exhausted { .. } | SelectError::RateLimited { .. })) => {
            warn!(deal_id = id, error = %err, "push sync could not reach the CRM");
            error_response(StatusCode::BAD_GATEWAY, err.to_string())
        }
        Err(err) => {
            warn!(deal_id = id, error = %err, "push sync failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

/// Serves the receiver over an already migrated pool until `cancel` fires.
pub async fn serve(
    config: &SyncConfig,
    pool: &PgPool,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    config.validate()?;
    let updater = dealsync_sync::build_updater(config, pool)?;

    let state = AppState::new(Arc::new(updater))
        .with_token(config.webhook_token.clone())
        .with_cancel(cancel.clone());
    let listener = TcpListener::bind(("0.0.0.0", config.webhook_port)).await?;
    info!(port = config.webhook_port, path = WEBHOOK_PATH, "push receiver listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let pool = dealsync_sync::connect(&config).await?;
    dealsync_sync::run_migrations(&pool).await?;
    serve(&config, &pool, CancellationToken::new()).await
}

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use docrules_core::config::CoreConfig;
use docrules_protocol::document::Document;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{RuleError, RunError};
use crate::link::LinkState;
use crate::lookup::ReferenceSource;
use crate::outcome::RunOutcome;
use crate::rule::{Rule, RuleType};
use crate::ruleset::RuleFilter;
use crate::runner::{DocumentRunner, RunnerSettings};
use crate::store::{RuleHistoryEntry, RuleStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDocument {
    pub rule: Rule,
    #[serde(default)]
    pub updated_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleResponse {
    pub version: u32,
    pub rule: Rule,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_by: Option<String>,
}

impl From<RuleHistoryEntry> for RuleResponse {
    fn from(value: RuleHistoryEntry) -> Self {
        Self {
            version: value.version,
            rule: value.rule,
            created_at: value.created_at,
            updated_by: value.updated_by,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRequest {
    pub document: Document,
    /// Rule families to run; empty runs all of them.
    #[serde(default)]
    pub tipos: Vec<RuleType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEvaluationRequest {
    pub documents: Vec<Document>,
    #[serde(default)]
    pub tipos: Vec<RuleType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BatchItem {
    Done(RunOutcome),
    Failed { error: ErrorResponse },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkRequest {
    pub activa: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkResponse {
    pub tenant_id: String,
    pub codigo: String,
    pub state: LinkState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

/// Error returned by the handlers, rendered as JSON.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                code: code.to_string(),
                message: message.into(),
            },
        }
    }
}

impl From<RuleError> for ApiError {
    fn from(err: RuleError) -> Self {
        match err {
            RuleError::NotFound(_) => ApiError::new(StatusCode::NOT_FOUND, "not_found", err.to_string()),
            RuleError::NotGlobal(_) | RuleError::InvalidRule(_) | RuleError::DuplicateRule { .. } => {
                ApiError::new(StatusCode::BAD_REQUEST, "invalid_rule", err.to_string())
            }
            _ => ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "rule_source", err.to_string()),
        }
    }
}

impl From<RunError> for ApiError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::Timeout(_) => ApiError::new(StatusCode::GATEWAY_TIMEOUT, "timeout", err.to_string()),
            RunError::RuleSetLoad(_) => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "rule_set_load", err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[derive(Clone)]
struct RuleServiceState {
    store: RuleStore,
    runner: DocumentRunner,
}

/// Configuration for the rule API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleServiceConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_bind_address() -> String {
    "0.0.0.0:8081".to_string()
}

impl Default for RuleServiceConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

impl From<&CoreConfig> for RuleServiceConfig {
    fn from(config: &CoreConfig) -> Self {
        Self {
            bind_address: config.http_bind.clone(),
        }
    }
}

/// Composes the REST API over a rule store.
#[derive(Clone)]
pub struct RuleApiBuilder {
    state: RuleServiceState,
}

impl RuleApiBuilder {
    /// Documents are evaluated against `store`, so rule and link edits take
    /// effect on the next run.
    pub fn new(
        store: RuleStore,
        references: Arc<dyn ReferenceSource>,
        settings: RunnerSettings,
    ) -> Self {
        let runner = DocumentRunner::new(Arc::new(store.clone()), references, settings);
        Self {
            state: RuleServiceState { store, runner },
        }
    }

    pub fn into_router(self) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/tenants", get(list_tenants))
            .route("/global-rules", get(list_global_rules).post(upsert_global_rule))
            .route("/tenants/:tenant/rules", get(list_rules).post(upsert_rule))
            .route(
                "/tenants/:tenant/rules/:codigo",
                get(get_rule).put(disable_rule),
            )
            .route("/tenants/:tenant/rules/:codigo/history", get(rule_history))
            .route(
                "/tenants/:tenant/global-rules/:codigo/link",
                get(get_link).post(set_link),
            )
            .route("/tenants/:tenant/evaluate", post(evaluate_document))
            .route("/tenants/:tenant/evaluate/batch", post(evaluate_batch))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state)
    }

    /// Spawns an HTTP server binding to the configured address.
    pub async fn serve(self, config: RuleServiceConfig) -> anyhow::Result<oneshot::Sender<()>> {
        let (tx, rx) = oneshot::channel();
        let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
        let state = self.state.clone();

        tokio::spawn(async move {
            info!(address = %config.bind_address, "starting rule service");
            let app = RuleApiBuilder { state }.into_router();
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = rx.await;
                })
                .await
                .ok();
        });

        Ok(tx)
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_tenants(State(state): State<RuleServiceState>) -> impl IntoResponse {
    Json(state.store.tenants())
}

fn responses(entries: Vec<RuleHistoryEntry>) -> Json<Vec<RuleResponse>> {
    Json(entries.into_iter().map(RuleResponse::from).collect())
}

async fn list_global_rules(State(state): State<RuleServiceState>) -> impl IntoResponse {
    responses(state.store.list_rules(None))
}

async fn upsert_global_rule(
    State(state): State<RuleServiceState>,
    Json(payload): Json<RuleDocument>,
) -> Result<Json<RuleResponse>, ApiError> {
    if payload.rule.tenant_id.is_some() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "tenant_mismatch",
            "global rules must not carry a tenantId",
        ));
    }
    let entry = state.store.put_rule(payload.rule, payload.updated_by);
    state.runner.invalidate(None);
    Ok(Json(entry.into()))
}

async fn list_rules(
    State(state): State<RuleServiceState>,
    Path(tenant): Path<String>,
) -> impl IntoResponse {
    responses(state.store.list_rules(Some(&tenant)))
}

async fn get_rule(
    State(state): State<RuleServiceState>,
    Path((tenant, codigo)): Path<(String, String)>,
) -> Result<Json<RuleResponse>, ApiError> {
    state
        .store
        .latest_rule(Some(&tenant), &codigo)
        .map(RuleResponse::from)
        .map(Json)
        .ok_or_else(|| RuleError::NotFound(codigo).into())
}

async fn rule_history(
    State(state): State<RuleServiceState>,
    Path((tenant, codigo)): Path<(String, String)>,
) -> Result<Json<Vec<RuleResponse>>, ApiError> {
    let history = state.store.rule_history(Some(&tenant), &codigo);
    if history.is_empty() {
        return Err(RuleError::NotFound(codigo).into());
    }
    Ok(responses(history))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DisableRequest {
    #[serde(default)]
    updated_by: Option<String>,
}

async fn disable_rule(
    State(state): State<RuleServiceState>,
    Path((tenant, codigo)): Path<(String, String)>,
    payload: Option<Json<DisableRequest>>,
) -> Result<Json<RuleResponse>, ApiError> {
    let payload = payload.map(|Json(body)| body).unwrap_or_default();
    let entry = state
        .store
        .disable_rule(Some(&tenant), &codigo, payload.updated_by)?;
    state.runner.invalidate(Some(&tenant));
    Ok(Json(entry.into()))
}

async fn upsert_rule(
    State(state): State<RuleServiceState>,
    Path(tenant): Path<String>,
    Json(mut payload): Json<RuleDocument>,
) -> Result<Json<RuleResponse>, ApiError> {
    match payload.rule.tenant_id.as_deref() {
        Some(owner) if owner != tenant => {
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                "tenant_mismatch",
                "tenant identifier mismatch",
            ));
        }
        _ => payload.rule.tenant_id = Some(tenant.clone()),
    }

    let entry = state.store.put_rule(payload.rule, payload.updated_by);
    state.runner.invalidate(Some(&tenant));
    Ok(Json(entry.into()))
}

async fn get_link(
    State(state): State<RuleServiceState>,
    Path((tenant, codigo)): Path<(String, String)>,
) -> impl IntoResponse {
    let link_state = state.store.link_state(&tenant, &codigo);
    Json(LinkResponse {
        tenant_id: tenant,
        codigo,
        state: link_state,
    })
}

async fn set_link(
    State(state): State<RuleServiceState>,
    Path((tenant, codigo)): Path<(String, String)>,
    Json(payload): Json<LinkRequest>,
) -> Result<Json<LinkResponse>, ApiError> {
    let link = state.store.set_link(&tenant, &codigo, payload.activa)?;
    state.runner.invalidate(Some(&tenant));
    Ok(Json(LinkResponse {
        tenant_id: link.tenant_id.clone(),
        codigo: link.rule_code.clone(),
        state: link.state(),
    }))
}

async fn evaluate_document(
    State(state): State<RuleServiceState>,
    Path(tenant): Path<String>,
    Json(payload): Json<EvaluationRequest>,
) -> Result<Json<RunOutcome>, ApiError> {
    let filter = RuleFilter::only(payload.tipos);
    let outcome = state.runner.run(&tenant, payload.document, &filter).await?;
    Ok(Json(outcome))
}

async fn evaluate_batch(
    State(state): State<RuleServiceState>,
    Path(tenant): Path<String>,
    Json(payload): Json<BatchEvaluationRequest>,
) -> impl IntoResponse {
    let filter = RuleFilter::only(payload.tipos);
    let items: Vec<BatchItem> = state
        .runner
        .run_batch(&tenant, payload.documents, &filter)
        .await
        .into_iter()
        .map(|result| match result {
            Ok(outcome) => BatchItem::Done(outcome),
            Err(err) => BatchItem::Failed {
                error: ApiError::from(err).body,
            },
        })
        .collect();
    Json(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::InMemoryReferenceSource;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn router(store: RuleStore) -> Router {
        RuleApiBuilder::new(
            store,
            Arc::new(InMemoryReferenceSource::default()),
            RunnerSettings::default(),
        )
        .into_router()
    }

    async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(value) => Body::from(value.to_string()),
                None => Body::empty(),
            })
            .expect("request");
        let response = router.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn rule_edits_take_effect_on_next_evaluation() {
        let app = router(RuleStore::new());

        let (status, _) = call(
            &app,
            "POST",
            "/tenants/tenant-a/rules",
            Some(json!({"rule": {
                "codigo": "UPPER", "tipo": "TRANSFORMACION",
                "acciones": [{"operacion": "UPPER_CASE", "campo": "proveedor"}]
            }})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(
            &app,
            "POST",
            "/tenants/tenant-a/evaluate",
            Some(json!({"document": {"proveedor": "acme"}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["document"]["proveedor"], json!("ACME"));

        let (status, body) = call(&app, "PUT", "/tenants/tenant-a/rules/UPPER", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], json!(2));

        let (_, body) = call(
            &app,
            "POST",
            "/tenants/tenant-a/evaluate",
            Some(json!({"document": {"proveedor": "acme"}})),
        )
        .await;
        assert_eq!(body["document"]["proveedor"], json!("acme"));
    }

    #[tokio::test]
    async fn global_rule_needs_explicit_link() {
        let app = router(RuleStore::new());
        call(
            &app,
            "POST",
            "/global-rules",
            Some(json!({"rule": {
                "codigo": "MARCA", "tipo": "TRANSFORMACION",
                "acciones": [{"operacion": "SET", "campo": "marcado", "valor": "SI"}]
            }})),
        )
        .await;

        let (_, body) = call(&app, "GET", "/tenants/tenant-a/global-rules/MARCA/link", None).await;
        assert_eq!(body["state"], json!("INHERITED_DISABLED"));

        let (_, body) = call(
            &app,
            "POST",
            "/tenants/tenant-a/evaluate",
            Some(json!({"document": {}})),
        )
        .await;
        assert!(body["document"].get("marcado").is_none());

        let (status, body) = call(
            &app,
            "POST",
            "/tenants/tenant-a/global-rules/MARCA/link",
            Some(json!({"activa": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], json!("EXPLICITLY_ENABLED"));

        let (_, body) = call(
            &app,
            "POST",
            "/tenants/tenant-a/evaluate",
            Some(json!({"document": {}})),
        )
        .await;
        assert_eq!(body["document"]["marcado"], json!("SI"));
    }

    #[tokio::test]
    async fn unknown_rule_is_not_found() {
        let app = router(RuleStore::new());
        let (status, body) = call(&app, "GET", "/tenants/tenant-a/rules/NADA", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], json!("not_found"));

        let (status, _) = call(
            &app,
            "POST",
            "/tenants/tenant-a/global-rules/NADA/link",
            Some(json!({"activa": true})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn mismatched_tenant_is_rejected() {
        let app = router(RuleStore::new());
        let (status, body) = call(
            &app,
            "POST",
            "/tenants/tenant-a/rules",
            Some(json!({"rule": {"codigo": "X", "tipo": "EXTRACCION", "tenantId": "tenant-b"}})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], json!("tenant_mismatch"));
    }

    #[tokio::test]
    async fn batch_returns_one_item_per_document() {
        let app = router(RuleStore::new());
        let (status, body) = call(
            &app,
            "POST",
            "/tenants/tenant-a/evaluate/batch",
            Some(json!({"documents": [{"n": 1}, {"n": 2}, {"n": 3}]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let items = body.as_array().expect("array");
        assert_eq!(items.len(), 3);
        assert_eq!(items[2]["document"]["n"], json!(3));
        assert_eq!(items[0]["report"]["verdict"], json!("PASS"));
    }
}

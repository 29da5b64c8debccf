use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;

use crate::cipher::SecretCipher;
use crate::config::AppConfig;
use crate::credentials::{CredentialError, CredentialVault};
use crate::error::ProxyError;
use crate::forwarder::ProxyForwarder;
use crate::governor::BudgetGovernor;
use crate::ledger::UsageLedger;
use crate::limits::RateLimiter;
use crate::store::{SqliteStore, now_millis, period_key_utc};
use crate::store_types::{BudgetConfigRecord, ProxyCredentialRecord};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("failed to build http client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Shared state behind the router. The admin plane carries administrative
/// actions (issue/revoke credentials, set secrets and budgets) whose caller
/// identity is resolved by an external layer; the token gate here is the
/// boundary, not an account system.
#[derive(Clone)]
pub struct AppState {
    forwarder: Arc<ProxyForwarder>,
    vault: Arc<CredentialVault>,
    store: SqliteStore,
    cipher: Arc<SecretCipher>,
    admin_token: Option<String>,
}

impl AppState {
    pub fn from_config(config: &AppConfig) -> Result<Self, StartupError> {
        let vault = Arc::new(CredentialVault::new(&config.pepper)?);
        let cipher = Arc::new(SecretCipher::new(&config.master_key));
        let store = SqliteStore::new(&config.sqlite_path);
        let limiter = Arc::new(tokio::sync::Mutex::new(RateLimiter::new(config.rate_limit)));
        let ledger = UsageLedger::new(store.clone(), config.pricing.clone());
        let governor = BudgetGovernor::new(store.clone(), config.thresholds.clone());
        let client = reqwest::Client::builder().build()?;

        let forwarder = Arc::new(ProxyForwarder::new(
            vault.clone(),
            cipher.clone(),
            store.clone(),
            limiter,
            ledger,
            governor,
            client,
            config.upstream_url.clone(),
            config.upstream_timeout,
            config.allowed_models.clone(),
        ));

        Ok(Self {
            forwarder,
            vault,
            store,
            cipher,
            admin_token: config.admin_token.clone(),
        })
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route(
            "/admin/credentials",
            get(list_credentials).post(create_credential),
        )
        .route("/admin/credentials/:id/revoke", post(revoke_credential))
        .route("/admin/orgs/:org_id/secret", put(put_org_secret))
        .route("/admin/budgets", put(put_budget))
        .route("/admin/alerts", get(list_alerts))
        .route("/admin/usage", get(usage_summary))
        .with_state(state)
}

async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let origin = caller_origin(&headers);
    state.forwarder.handle(&headers, &origin, body).await
}

/// Rate-limit fallback identity for requests without a credential.
fn caller_origin(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ProxyError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(ProxyError::Authentication);
    };
    let provided = headers
        .get("x-admin-token")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !provided.is_empty() && bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(ProxyError::Authentication)
    }
}

fn internal(err: impl std::fmt::Display) -> ProxyError {
    ProxyError::Internal(err.to_string())
}

#[derive(Debug, Deserialize)]
struct CreateCredentialRequest {
    org_id: String,
    project_id: String,
    name: String,
}

/// The only moment the plaintext secret exists outside the caller's hands.
#[derive(Debug, Serialize)]
struct CreateCredentialResponse {
    id: String,
    org_id: String,
    project_id: String,
    name: String,
    secret: String,
    created_at_ms: i64,
}

async fn create_credential(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateCredentialRequest>,
) -> Result<Response, ProxyError> {
    require_admin(&state, &headers)?;
    if request.org_id.is_empty() || request.project_id.is_empty() || request.name.is_empty() {
        return Err(ProxyError::Validation {
            reason: "org_id, project_id, and name are required".to_string(),
        });
    }

    let secret = state.vault.generate().map_err(internal)?;
    let record = ProxyCredentialRecord {
        id: format!("cred-{}", Uuid::new_v4()),
        org_id: request.org_id,
        project_id: request.project_id,
        name: request.name,
        fingerprint: state.vault.fingerprint(&secret),
        active: true,
        created_at_ms: now_millis(),
        revoked_at_ms: None,
    };
    state
        .store
        .insert_credential(&record)
        .await
        .map_err(internal)?;

    tracing::info!(credential_id = %record.id, org_id = %record.org_id, "credential issued");
    Ok((
        StatusCode::CREATED,
        Json(CreateCredentialResponse {
            id: record.id,
            org_id: record.org_id,
            project_id: record.project_id,
            name: record.name,
            secret,
            created_at_ms: record.created_at_ms,
        }),
    )
        .into_response())
}

async fn list_credentials(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ProxyError> {
    require_admin(&state, &headers)?;
    let credentials = state.store.list_credentials().await.map_err(internal)?;
    Ok(Json(credentials).into_response())
}

async fn revoke_credential(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ProxyError> {
    require_admin(&state, &headers)?;
    state
        .store
        .revoke_credential(&id, now_millis())
        .await
        .map_err(internal)?;
    tracing::info!(credential_id = %id, "credential revoked");
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Debug, Deserialize)]
struct PutSecretRequest {
    secret: String,
}

async fn put_org_secret(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(org_id): Path<String>,
    Json(request): Json<PutSecretRequest>,
) -> Result<Response, ProxyError> {
    require_admin(&state, &headers)?;
    if request.secret.is_empty() {
        return Err(ProxyError::Validation {
            reason: "secret is required".to_string(),
        });
    }

    // Values already in the encrypted bundle format are stored verbatim so
    // rows can be migrated between deployments sharing a master key.
    let bundle = if SecretCipher::is_encrypted_format(&request.secret) {
        request.secret
    } else {
        state.cipher.encrypt(&request.secret).map_err(internal)?
    };
    state
        .store
        .put_org_secret(&org_id, &bundle)
        .await
        .map_err(internal)?;
    tracing::info!(org_id = %org_id, "upstream secret updated");
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn put_budget(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(record): Json<BudgetConfigRecord>,
) -> Result<Response, ProxyError> {
    require_admin(&state, &headers)?;
    if record.scope_id.is_empty() {
        return Err(ProxyError::Validation {
            reason: "scope_id is required".to_string(),
        });
    }
    state.store.put_budget(&record).await.map_err(internal)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn list_alerts(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ProxyError> {
    require_admin(&state, &headers)?;
    let alerts = state.store.list_alerts().await.map_err(internal)?;
    Ok(Json(alerts).into_response())
}

#[derive(Debug, Deserialize)]
struct UsageSummaryQuery {
    org_id: String,
    #[serde(default)]
    project_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct UsageSummaryResponse {
    period: String,
    org_id: String,
    org_spend_usd_micros: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    project_spend_usd_micros: Option<u64>,
}

async fn usage_summary(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<UsageSummaryQuery>,
) -> Result<Response, ProxyError> {
    require_admin(&state, &headers)?;
    let period = period_key_utc(now_millis());

    let org_spend = state
        .store
        .month_to_date_usd_micros(
            crate::store_types::BudgetScope::Organization,
            &query.org_id,
            &period,
        )
        .await
        .map_err(internal)?;

    let project_spend = match &query.project_id {
        Some(project_id) => Some(
            state
                .store
                .month_to_date_usd_micros(
                    crate::store_types::BudgetScope::Project,
                    project_id,
                    &period,
                )
                .await
                .map_err(internal)?,
        ),
        None => None,
    };

    Ok(Json(UsageSummaryResponse {
        period,
        org_id: query.org_id,
        org_spend_usd_micros: org_spend,
        project_id: query.project_id,
        project_spend_usd_micros: project_spend,
    })
    .into_response())
}

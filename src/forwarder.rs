use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tracing::Instrument;
use uuid::Uuid;

use crate::cipher::SecretCipher;
use crate::credentials::CredentialVault;
use crate::error::ProxyError;
use crate::governor::BudgetGovernor;
use crate::ledger::{UsageEvent, UsageLedger};
use crate::limits::RateLimiter;
use crate::store::SqliteStore;

/// Correlation header attached to every response, success or failure.
pub const TRACE_HEADER: &str = "x-keymeter-trace-id";

/// Inbound headers copied to the outbound request. Everything else is
/// dropped; authorization in particular is always rebuilt server-side from
/// the decrypted upstream secret, never taken from the caller.
const PASSTHROUGH_HEADERS: [&str; 2] = ["accept", "user-agent"];

const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// Validates an inbound request, resolves the caller's credential and
/// organization, decrypts the upstream secret, forwards the call, and passes
/// the upstream response through unmodified. Metering runs after the
/// response is determined and can never alter it.
pub struct ProxyForwarder {
    vault: Arc<CredentialVault>,
    cipher: Arc<SecretCipher>,
    store: SqliteStore,
    limiter: Arc<tokio::sync::Mutex<RateLimiter>>,
    ledger: UsageLedger,
    governor: BudgetGovernor,
    client: reqwest::Client,
    upstream_url: String,
    upstream_timeout: Duration,
    allowed_models: Vec<String>,
}

impl ProxyForwarder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vault: Arc<CredentialVault>,
        cipher: Arc<SecretCipher>,
        store: SqliteStore,
        limiter: Arc<tokio::sync::Mutex<RateLimiter>>,
        ledger: UsageLedger,
        governor: BudgetGovernor,
        client: reqwest::Client,
        upstream_url: String,
        upstream_timeout: Duration,
        allowed_models: Vec<String>,
    ) -> Self {
        Self {
            vault,
            cipher,
            store,
            limiter,
            ledger,
            governor,
            client,
            upstream_url,
            upstream_timeout,
            allowed_models,
        }
    }

    /// Full request pipeline. The trace id is minted before anything else so
    /// every outcome, including local failures, stays correlatable.
    pub async fn handle(&self, headers: &HeaderMap, origin: &str, body: Bytes) -> Response {
        let trace_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "proxy_request",
            request_id = %trace_id,
            model = tracing::field::Empty,
            credential_id = tracing::field::Empty,
            status = tracing::field::Empty,
        );
        let result = self
            .run(&trace_id, headers, origin, body)
            .instrument(span)
            .await;

        let mut response = match result {
            Ok(response) => response,
            Err(err) => err.into_response(),
        };
        if let Ok(value) = HeaderValue::from_str(&trace_id) {
            response
                .headers_mut()
                .insert(HeaderName::from_static(TRACE_HEADER), value);
        }
        response
    }

    async fn run(
        &self,
        trace_id: &str,
        headers: &HeaderMap,
        origin: &str,
        body: Bytes,
    ) -> Result<Response, ProxyError> {
        let bearer = extract_bearer(headers);

        // Throughput gate, independent of budgets. Keyed by the credential
        // fingerprint when present so raw secrets never sit in the limiter,
        // with the caller origin as fallback for anonymous traffic.
        let rate_key = match bearer {
            Some(secret) => format!("key:{}", self.vault.fingerprint(secret)),
            None => format!("origin:{origin}"),
        };
        {
            let now = crate::store::now_millis().max(0) as u64 / 1000;
            self.limiter.lock().await.admit(&rate_key, now)?;
        }

        let secret = bearer.ok_or(ProxyError::Authentication)?;
        let active = self
            .store
            .load_active_credentials()
            .await
            .map_err(|err| ProxyError::Internal(err.to_string()))?;
        let credential = self
            .vault
            .verify(secret, &active)
            .ok_or(ProxyError::Authentication)?
            .clone();
        tracing::Span::current().record(
            "credential_id",
            tracing::field::display(&credential.id),
        );

        let payload: serde_json::Value =
            serde_json::from_slice(&body).map_err(|_| ProxyError::Validation {
                reason: "request body must be valid JSON".to_string(),
            })?;
        let model = payload
            .get("model")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| ProxyError::Validation {
                reason: "missing required field: model".to_string(),
            })?
            .to_string();
        if !payload
            .get("messages")
            .map(serde_json::Value::is_array)
            .unwrap_or(false)
        {
            return Err(ProxyError::Validation {
                reason: "missing required field: messages".to_string(),
            });
        }
        tracing::Span::current().record("model", tracing::field::display(&model));

        // Unvalidated models would corrupt cost accounting downstream, so
        // the allowlist is enforced before anything leaves the process.
        if !self.allowed_models.iter().any(|allowed| allowed == &model) {
            return Err(ProxyError::Validation {
                reason: format!(
                    "model {model} is not supported; allowed models: {}",
                    self.allowed_models.join(", ")
                ),
            });
        }

        let bundle = self
            .store
            .load_org_secret(&credential.org_id)
            .await
            .map_err(|err| ProxyError::Internal(err.to_string()))?
            .ok_or_else(|| {
                ProxyError::Configuration(
                    "upstream secret not configured for organization".to_string(),
                )
            })?;
        // Decrypted only for the duration of the outbound call, never logged.
        let upstream_secret = self.cipher.decrypt(&bundle).map_err(|_| {
            ProxyError::Configuration("upstream secret could not be decrypted".to_string())
        })?;

        let outbound = self
            .client
            .post(format!("{}{CHAT_COMPLETIONS_PATH}", self.upstream_url))
            .headers(allowlisted_headers(headers))
            .header(header::CONTENT_TYPE, "application/json")
            .bearer_auth(&upstream_secret)
            .timeout(self.upstream_timeout)
            .body(body);

        let upstream_response = outbound
            .send()
            .await
            .map_err(|err| self.map_outbound_error(err))?;

        let status = upstream_response.status();
        let content_type = upstream_response.headers().get(header::CONTENT_TYPE).cloned();
        let response_body = upstream_response
            .bytes()
            .await
            .map_err(|err| self.map_outbound_error(err))?;
        tracing::Span::current().record("status", tracing::field::display(status.as_u16()));

        if status.is_success() {
            match extract_usage(&response_body) {
                Some((prompt_tokens, completion_tokens)) => {
                    self.dispatch_governance(UsageEvent {
                        trace_id: trace_id.to_string(),
                        org_id: credential.org_id.clone(),
                        project_id: credential.project_id.clone(),
                        credential_id: credential.id.clone(),
                        model,
                        prompt_tokens,
                        completion_tokens,
                    });
                }
                None => {
                    tracing::debug!("upstream response carried no usage telemetry, not metered");
                }
            }
        }

        // Passthrough: the upstream's status and body, unmodified, whether it
        // reported success or its own error. No retries.
        let mut builder = Response::builder().status(status);
        if let Some(content_type) = content_type {
            builder = builder.header(header::CONTENT_TYPE, content_type);
        }
        builder
            .body(Body::from(response_body))
            .map_err(|err| ProxyError::Internal(err.to_string()))
    }

    fn map_outbound_error(&self, err: reqwest::Error) -> ProxyError {
        if err.is_timeout() {
            ProxyError::Timeout {
                secs: self.upstream_timeout.as_secs(),
            }
        } else {
            ProxyError::UpstreamTransport(err.to_string())
        }
    }

    /// Ledger append and budget evaluation run on a detached task with their
    /// own error boundary. Whatever happens here, the response already
    /// computed for the client is not affected.
    fn dispatch_governance(&self, event: UsageEvent) {
        let ledger = self.ledger.clone();
        let governor = self.governor.clone();
        tokio::spawn(async move {
            let record = match ledger.append(event).await {
                Ok(record) => record,
                Err(err) => {
                    tracing::warn!(error = %err, "usage ledger write failed");
                    return;
                }
            };
            if let Err(err) = governor
                .evaluate(&record.org_id, Some(&record.project_id))
                .await
            {
                tracing::warn!(error = %err, "budget evaluation failed");
            }
        });
    }
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn allowlisted_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for name in PASSTHROUGH_HEADERS {
        if let Some(value) = inbound.get(name) {
            out.insert(HeaderName::from_static(name), value.clone());
        }
    }
    out
}

/// Token counts from an OpenAI-compatible `usage` object. Both counts must
/// be present; there are no synthetic or estimated records.
fn extract_usage(body: &[u8]) -> Option<(u64, u64)> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let usage = value.get("usage")?;
    let prompt_tokens = usage.get("prompt_tokens")?.as_u64()?;
    let completion_tokens = usage.get("completion_tokens")?.as_u64()?;
    Some((prompt_tokens, completion_tokens))
}

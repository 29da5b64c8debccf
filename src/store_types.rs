use serde::{Deserialize, Serialize};

/// One issuable secret scoped to an organization and a project. Only the
/// keyed fingerprint of the secret is ever stored; the fingerprint itself is
/// skipped during serialization so it never leaks through API responses.
#[derive(Clone, Debug, Serialize)]
pub struct ProxyCredentialRecord {
    pub id: String,
    pub org_id: String,
    pub project_id: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub fingerprint: String,
    pub active: bool,
    pub created_at_ms: i64,
    pub revoked_at_ms: Option<i64>,
}

/// One immutable ledger row per successfully forwarded and metered call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageRecord {
    pub trace_id: String,
    pub org_id: String,
    pub project_id: String,
    pub credential_id: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd_micros: u64,
    pub prompt_usd_micros_per_mtok: u64,
    pub completion_usd_micros_per_mtok: u64,
    pub currency: String,
    pub status: String,
    pub created_at_ms: i64,
    /// UTC calendar month of `created_at_ms`, e.g. `2026-08`. Denormalized so
    /// month-to-date aggregation is an indexed sum.
    pub period: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    Organization,
    Project,
}

impl BudgetScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetScope::Organization => "organization",
            BudgetScope::Project => "project",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "organization" => Some(BudgetScope::Organization),
            "project" => Some(BudgetScope::Project),
            _ => None,
        }
    }
}

/// Monthly spend ceiling for one scope. `None` means unlimited.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BudgetConfigRecord {
    pub scope: BudgetScope,
    pub scope_id: String,
    pub limit_usd_micros: Option<u64>,
}

/// One threshold crossing. At most one row exists per
/// (scope, scope_id, threshold, period); insertion is idempotent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: i64,
    pub scope: BudgetScope,
    pub scope_id: String,
    pub threshold_pct: u32,
    pub limit_usd_micros: u64,
    pub spend_usd_micros: u64,
    pub period: String,
    pub created_at_ms: i64,
}

use thiserror::Error;

use crate::pricing::{PriceSnapshot, PricingTable, cost_usd_micros};
use crate::store::{SqliteStore, StoreError, now_millis, period_key_utc};
use crate::store_types::UsageRecord;

/// Usage telemetry extracted from one successful upstream response.
#[derive(Clone, Debug)]
pub struct UsageEvent {
    pub trace_id: String,
    pub org_id: String,
    pub project_id: String,
    pub credential_id: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid usage event: {reason}")]
    Invalid { reason: &'static str },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Appends one immutable usage row per metered call. Cost and the price
/// snapshot are computed exactly once here and never recomputed.
#[derive(Clone)]
pub struct UsageLedger {
    store: SqliteStore,
    pricing: PricingTable,
}

impl UsageLedger {
    pub fn new(store: SqliteStore, pricing: PricingTable) -> Self {
        Self { store, pricing }
    }

    pub async fn append(&self, event: UsageEvent) -> Result<UsageRecord, LedgerError> {
        if event.trace_id.is_empty() {
            return Err(LedgerError::Invalid {
                reason: "missing trace id",
            });
        }
        if event.org_id.is_empty() || event.project_id.is_empty() {
            return Err(LedgerError::Invalid {
                reason: "missing scope reference",
            });
        }

        // The model allowlist is enforced before the upstream call, so a
        // missing price row can only come from a config gap. Record zero cost
        // rather than block governance of the response that already happened.
        let snapshot = match self.pricing.snapshot(&event.model) {
            Some(snapshot) => snapshot,
            None => {
                tracing::warn!(
                    model = %event.model,
                    "no pricing for model, recording zero cost"
                );
                PriceSnapshot::default()
            }
        };
        let cost = cost_usd_micros(&snapshot, event.prompt_tokens, event.completion_tokens);

        let created_at_ms = now_millis();
        let record = UsageRecord {
            trace_id: event.trace_id,
            org_id: event.org_id,
            project_id: event.project_id,
            credential_id: event.credential_id,
            model: event.model,
            prompt_tokens: event.prompt_tokens,
            completion_tokens: event.completion_tokens,
            cost_usd_micros: cost,
            prompt_usd_micros_per_mtok: snapshot.prompt_usd_micros_per_mtok,
            completion_usd_micros_per_mtok: snapshot.completion_usd_micros_per_mtok,
            currency: "USD".to_string(),
            status: "success".to_string(),
            created_at_ms,
            period: period_key_utc(created_at_ms),
        };
        self.store.append_usage(&record).await?;
        Ok(record)
    }
}

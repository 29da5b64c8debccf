use thiserror::Error;

use crate::store::{SqliteStore, StoreError, now_millis, period_key_utc};
use crate::store_types::BudgetScope;

/// Descending ladder; the first threshold at or below the observed
/// percent-used is the one that matters per evaluation.
pub const DEFAULT_THRESHOLD_LADDER: [u32; 4] = [100, 90, 75, 50];

#[derive(Debug, Error)]
pub enum GovernorError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Evaluates month-to-date spend against configured ceilings and emits
/// deduplicated threshold alerts. Advisory only: it never blocks traffic,
/// and its failures never reach the response path.
#[derive(Clone)]
pub struct BudgetGovernor {
    store: SqliteStore,
    ladder: Vec<u32>,
}

impl BudgetGovernor {
    pub fn new(store: SqliteStore, ladder: Vec<u32>) -> Self {
        Self { store, ladder }
    }

    /// Recomputes spend independently for the organization scope and, when
    /// present, the project scope. Safe to run concurrently: alert emission
    /// is idempotent by constraint, so at-least-once evaluation is fine.
    pub async fn evaluate(
        &self,
        org_id: &str,
        project_id: Option<&str>,
    ) -> Result<(), GovernorError> {
        let period = period_key_utc(now_millis());
        self.evaluate_scope(BudgetScope::Organization, org_id, &period)
            .await?;
        if let Some(project_id) = project_id {
            self.evaluate_scope(BudgetScope::Project, project_id, &period)
                .await?;
        }
        Ok(())
    }

    async fn evaluate_scope(
        &self,
        scope: BudgetScope,
        scope_id: &str,
        period: &str,
    ) -> Result<(), GovernorError> {
        let Some(budget) = self.store.load_budget(scope, scope_id).await? else {
            return Ok(());
        };
        let Some(limit) = budget.limit_usd_micros else {
            return Ok(());
        };
        if limit == 0 {
            return Ok(());
        }

        let spend = self
            .store
            .month_to_date_usd_micros(scope, scope_id, period)
            .await?;
        let percent_used = u128::from(spend) * 100 / u128::from(limit);

        let Some(threshold) = self
            .ladder
            .iter()
            .copied()
            .find(|threshold| percent_used >= u128::from(*threshold))
        else {
            return Ok(());
        };

        let inserted = self
            .store
            .insert_alert(scope, scope_id, threshold, limit, spend, period)
            .await?;
        if inserted {
            tracing::info!(
                scope = scope.as_str(),
                scope_id,
                threshold,
                spend_usd_micros = spend,
                limit_usd_micros = limit,
                period,
                "budget threshold crossed"
            );
        }
        Ok(())
    }
}

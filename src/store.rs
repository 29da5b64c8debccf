use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::OptionalExtension;
use thiserror::Error;
use time::OffsetDateTime;

use crate::store_types::{
    AlertRecord, BudgetConfigRecord, BudgetScope, ProxyCredentialRecord, UsageRecord,
};

/// SQLite-backed persistence for credentials, upstream secrets, the usage
/// ledger, budgets, and alerts. Holds only the path; every call opens a
/// connection on a blocking thread, so the store is cheap to clone into
/// background tasks.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    pub async fn insert_credential(
        &self,
        record: &ProxyCredentialRecord,
    ) -> Result<(), StoreError> {
        let path = self.path.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO proxy_credentials
                     (id, org_id, project_id, name, fingerprint, active, created_at_ms, revoked_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    record.id,
                    record.org_id,
                    record.project_id,
                    record.name,
                    record.fingerprint,
                    record.active as i32,
                    record.created_at_ms,
                    record.revoked_at_ms,
                ],
            )?;
            Ok(())
        })
        .await?
    }

    /// The active credential set scanned during verification. Revoked rows
    /// are excluded here, so they always fail verification.
    pub async fn load_active_credentials(&self) -> Result<Vec<ProxyCredentialRecord>, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<ProxyCredentialRecord>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT id, org_id, project_id, name, fingerprint, active, created_at_ms, revoked_at_ms
                 FROM proxy_credentials WHERE active = 1 ORDER BY created_at_ms",
            )?;
            let rows = stmt.query_map([], credential_from_row)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
        })
        .await?
    }

    pub async fn list_credentials(&self) -> Result<Vec<ProxyCredentialRecord>, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<ProxyCredentialRecord>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT id, org_id, project_id, name, fingerprint, active, created_at_ms, revoked_at_ms
                 FROM proxy_credentials ORDER BY created_at_ms",
            )?;
            let rows = stmt.query_map([], credential_from_row)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
        })
        .await?
    }

    /// One-way transition to revoked. Revoking an already-revoked credential
    /// is a no-op success; `revoked_at_ms` is only ever set once.
    pub async fn revoke_credential(&self, id: &str, now_ms: i64) -> Result<(), StoreError> {
        let path = self.path.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "UPDATE proxy_credentials
                 SET active = 0, revoked_at_ms = ?2
                 WHERE id = ?1 AND active = 1",
                rusqlite::params![id, now_ms],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn put_org_secret(&self, org_id: &str, bundle: &str) -> Result<(), StoreError> {
        let path = self.path.clone();
        let org_id = org_id.to_string();
        let bundle = bundle.to_string();
        let now_ms = now_millis();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO org_secrets (org_id, bundle, updated_at_ms)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(org_id) DO UPDATE SET bundle = ?2, updated_at_ms = ?3",
                rusqlite::params![org_id, bundle, now_ms],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn load_org_secret(&self, org_id: &str) -> Result<Option<String>, StoreError> {
        let path = self.path.clone();
        let org_id = org_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<String>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.query_row(
                "SELECT bundle FROM org_secrets WHERE org_id = ?1",
                rusqlite::params![org_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await?
    }

    /// Append-only: no update or delete path exists for usage rows.
    pub async fn append_usage(&self, record: &UsageRecord) -> Result<(), StoreError> {
        let path = self.path.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO usage_records
                     (trace_id, org_id, project_id, credential_id, model,
                      prompt_tokens, completion_tokens, cost_usd_micros,
                      prompt_usd_micros_per_mtok, completion_usd_micros_per_mtok,
                      currency, status, created_at_ms, period)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                rusqlite::params![
                    record.trace_id,
                    record.org_id,
                    record.project_id,
                    record.credential_id,
                    record.model,
                    u64_to_i64(record.prompt_tokens),
                    u64_to_i64(record.completion_tokens),
                    u64_to_i64(record.cost_usd_micros),
                    u64_to_i64(record.prompt_usd_micros_per_mtok),
                    u64_to_i64(record.completion_usd_micros_per_mtok),
                    record.currency,
                    record.status,
                    record.created_at_ms,
                    record.period,
                ],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn list_usage(
        &self,
        org_id: &str,
        period: &str,
    ) -> Result<Vec<UsageRecord>, StoreError> {
        let path = self.path.clone();
        let org_id = org_id.to_string();
        let period = period.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<UsageRecord>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT trace_id, org_id, project_id, credential_id, model,
                        prompt_tokens, completion_tokens, cost_usd_micros,
                        prompt_usd_micros_per_mtok, completion_usd_micros_per_mtok,
                        currency, status, created_at_ms, period
                 FROM usage_records
                 WHERE org_id = ?1 AND period = ?2
                 ORDER BY id",
            )?;
            let rows = stmt.query_map(rusqlite::params![org_id, period], usage_from_row)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
        })
        .await?
    }

    /// Month-to-date spend for one scope: the sum of ledger costs whose
    /// period key matches the current UTC calendar month.
    pub async fn month_to_date_usd_micros(
        &self,
        scope: BudgetScope,
        scope_id: &str,
        period: &str,
    ) -> Result<u64, StoreError> {
        let path = self.path.clone();
        let scope_id = scope_id.to_string();
        let period = period.to_string();
        let column = match scope {
            BudgetScope::Organization => "org_id",
            BudgetScope::Project => "project_id",
        };
        tokio::task::spawn_blocking(move || -> Result<u64, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let sum: i64 = conn.query_row(
                &format!(
                    "SELECT COALESCE(SUM(cost_usd_micros), 0)
                     FROM usage_records WHERE {column} = ?1 AND period = ?2"
                ),
                rusqlite::params![scope_id, period],
                |row| row.get(0),
            )?;
            Ok(i64_to_u64(sum))
        })
        .await?
    }

    pub async fn put_budget(&self, record: &BudgetConfigRecord) -> Result<(), StoreError> {
        let path = self.path.clone();
        let record = record.clone();
        let now_ms = now_millis();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO budget_configs (scope, scope_id, limit_usd_micros, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(scope, scope_id) DO UPDATE SET limit_usd_micros = ?3, updated_at_ms = ?4",
                rusqlite::params![
                    record.scope.as_str(),
                    record.scope_id,
                    record.limit_usd_micros.map(u64_to_i64),
                    now_ms,
                ],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn load_budget(
        &self,
        scope: BudgetScope,
        scope_id: &str,
    ) -> Result<Option<BudgetConfigRecord>, StoreError> {
        let path = self.path.clone();
        let scope_id = scope_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<BudgetConfigRecord>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.query_row(
                "SELECT limit_usd_micros FROM budget_configs WHERE scope = ?1 AND scope_id = ?2",
                rusqlite::params![scope.as_str(), scope_id],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()
            .map_err(StoreError::from)
            .map(|found| {
                found.map(|limit| BudgetConfigRecord {
                    scope,
                    scope_id: scope_id.clone(),
                    limit_usd_micros: limit.map(i64_to_u64),
                })
            })
        })
        .await?
    }

    /// Idempotent alert emission. The UNIQUE constraint on
    /// (scope, scope_id, threshold, period) turns duplicate inserts into
    /// no-ops, which is what makes concurrent evaluation safe without locks.
    /// Returns whether a new row was written.
    pub async fn insert_alert(
        &self,
        scope: BudgetScope,
        scope_id: &str,
        threshold_pct: u32,
        limit_usd_micros: u64,
        spend_usd_micros: u64,
        period: &str,
    ) -> Result<bool, StoreError> {
        let path = self.path.clone();
        let scope_id = scope_id.to_string();
        let period = period.to_string();
        let now_ms = now_millis();
        tokio::task::spawn_blocking(move || -> Result<bool, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO alerts
                     (scope, scope_id, threshold_pct, limit_usd_micros, spend_usd_micros, period, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    scope.as_str(),
                    scope_id,
                    threshold_pct,
                    u64_to_i64(limit_usd_micros),
                    u64_to_i64(spend_usd_micros),
                    period,
                    now_ms,
                ],
            )?;
            Ok(inserted > 0)
        })
        .await?
    }

    pub async fn list_alerts(&self) -> Result<Vec<AlertRecord>, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<AlertRecord>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT id, scope, scope_id, threshold_pct, limit_usd_micros,
                        spend_usd_micros, period, created_at_ms
                 FROM alerts ORDER BY id",
            )?;
            let rows = stmt.query_map([], |row| {
                let scope: String = row.get(1)?;
                Ok(AlertRecord {
                    id: row.get(0)?,
                    scope: BudgetScope::parse(&scope).unwrap_or(BudgetScope::Organization),
                    scope_id: row.get(2)?,
                    threshold_pct: row.get(3)?,
                    limit_usd_micros: i64_to_u64(row.get(4)?),
                    spend_usd_micros: i64_to_u64(row.get(5)?),
                    period: row.get(6)?,
                    created_at_ms: row.get(7)?,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
        })
        .await?
    }
}

fn credential_from_row(row: &rusqlite::Row<'_>) -> Result<ProxyCredentialRecord, rusqlite::Error> {
    Ok(ProxyCredentialRecord {
        id: row.get(0)?,
        org_id: row.get(1)?,
        project_id: row.get(2)?,
        name: row.get(3)?,
        fingerprint: row.get(4)?,
        active: row.get::<_, i32>(5)? != 0,
        created_at_ms: row.get(6)?,
        revoked_at_ms: row.get(7)?,
    })
}

fn usage_from_row(row: &rusqlite::Row<'_>) -> Result<UsageRecord, rusqlite::Error> {
    Ok(UsageRecord {
        trace_id: row.get(0)?,
        org_id: row.get(1)?,
        project_id: row.get(2)?,
        credential_id: row.get(3)?,
        model: row.get(4)?,
        prompt_tokens: i64_to_u64(row.get(5)?),
        completion_tokens: i64_to_u64(row.get(6)?),
        cost_usd_micros: i64_to_u64(row.get(7)?),
        prompt_usd_micros_per_mtok: i64_to_u64(row.get(8)?),
        completion_usd_micros_per_mtok: i64_to_u64(row.get(9)?),
        currency: row.get(10)?,
        status: row.get(11)?,
        created_at_ms: row.get(12)?,
        period: row.get(13)?,
    })
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS proxy_credentials (
            id TEXT PRIMARY KEY NOT NULL,
            org_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            name TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            created_at_ms INTEGER NOT NULL,
            revoked_at_ms INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_proxy_credentials_active
            ON proxy_credentials(active);
        CREATE INDEX IF NOT EXISTS idx_proxy_credentials_fingerprint
            ON proxy_credentials(fingerprint);

        CREATE TABLE IF NOT EXISTS org_secrets (
            org_id TEXT PRIMARY KEY NOT NULL,
            bundle TEXT NOT NULL,
            updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS usage_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            trace_id TEXT NOT NULL,
            org_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            credential_id TEXT NOT NULL,
            model TEXT NOT NULL,
            prompt_tokens INTEGER NOT NULL,
            completion_tokens INTEGER NOT NULL,
            cost_usd_micros INTEGER NOT NULL,
            prompt_usd_micros_per_mtok INTEGER NOT NULL,
            completion_usd_micros_per_mtok INTEGER NOT NULL,
            currency TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL,
            period TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_usage_records_org_period
            ON usage_records(org_id, period);
        CREATE INDEX IF NOT EXISTS idx_usage_records_project_period
            ON usage_records(project_id, period);

        CREATE TABLE IF NOT EXISTS budget_configs (
            scope TEXT NOT NULL,
            scope_id TEXT NOT NULL,
            limit_usd_micros INTEGER,
            updated_at_ms INTEGER NOT NULL,
            PRIMARY KEY (scope, scope_id)
        );

        CREATE TABLE IF NOT EXISTS alerts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            scope TEXT NOT NULL,
            scope_id TEXT NOT NULL,
            threshold_pct INTEGER NOT NULL,
            limit_usd_micros INTEGER NOT NULL,
            spend_usd_micros INTEGER NOT NULL,
            period TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL,
            UNIQUE (scope, scope_id, threshold_pct, period)
        );",
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

/// UTC calendar-month key (`YYYY-MM`) for a millisecond timestamp.
pub fn period_key_utc(ms: i64) -> String {
    let ts = OffsetDateTime::from_unix_timestamp(ms.div_euclid(1000))
        .unwrap_or(OffsetDateTime::UNIX_EPOCH);
    format!("{:04}-{:02}", ts.year(), u8::from(ts.month()))
}

fn u64_to_i64(value: u64) -> i64 {
    if value > i64::MAX as u64 {
        i64::MAX
    } else {
        value as i64
    }
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(id: &str) -> ProxyCredentialRecord {
        ProxyCredentialRecord {
            id: id.to_string(),
            org_id: "org-1".to_string(),
            project_id: "proj-1".to_string(),
            name: "ci".to_string(),
            fingerprint: format!("fp-{id}"),
            active: true,
            created_at_ms: now_millis(),
            revoked_at_ms: None,
        }
    }

    fn usage(org: &str, project: &str, cost: u64, period: &str) -> UsageRecord {
        UsageRecord {
            trace_id: uuid::Uuid::new_v4().to_string(),
            org_id: org.to_string(),
            project_id: project.to_string(),
            credential_id: "cred-1".to_string(),
            model: "gpt-4o".to_string(),
            prompt_tokens: 10,
            completion_tokens: 20,
            cost_usd_micros: cost,
            prompt_usd_micros_per_mtok: 2_500_000,
            completion_usd_micros_per_mtok: 10_000_000,
            currency: "USD".to_string(),
            status: "success".to_string(),
            created_at_ms: now_millis(),
            period: period.to_string(),
        }
    }

    fn temp_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("keymeter.db"));
        (dir, store)
    }

    #[tokio::test]
    async fn revoke_is_one_way_and_idempotent() {
        let (_dir, store) = temp_store();
        store.insert_credential(&credential("cred-1")).await.unwrap();

        assert_eq!(store.load_active_credentials().await.unwrap().len(), 1);

        store.revoke_credential("cred-1", 1_000).await.unwrap();
        // Second revoke is a no-op and must not move revoked_at.
        store.revoke_credential("cred-1", 2_000).await.unwrap();

        assert!(store.load_active_credentials().await.unwrap().is_empty());
        let all = store.list_credentials().await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(!all[0].active);
        assert_eq!(all[0].revoked_at_ms, Some(1_000));
    }

    #[tokio::test]
    async fn month_to_date_sums_only_matching_scope_and_period() {
        let (_dir, store) = temp_store();
        store
            .append_usage(&usage("org-1", "proj-1", 100, "2026-08"))
            .await
            .unwrap();
        store
            .append_usage(&usage("org-1", "proj-2", 250, "2026-08"))
            .await
            .unwrap();
        store
            .append_usage(&usage("org-1", "proj-1", 999, "2026-07"))
            .await
            .unwrap();
        store
            .append_usage(&usage("org-2", "proj-3", 42, "2026-08"))
            .await
            .unwrap();

        let org = store
            .month_to_date_usd_micros(BudgetScope::Organization, "org-1", "2026-08")
            .await
            .unwrap();
        assert_eq!(org, 350);

        let project = store
            .month_to_date_usd_micros(BudgetScope::Project, "proj-1", "2026-08")
            .await
            .unwrap();
        assert_eq!(project, 100);
    }

    #[tokio::test]
    async fn alert_insert_is_idempotent_per_scope_threshold_period() {
        let (_dir, store) = temp_store();
        let first = store
            .insert_alert(BudgetScope::Organization, "org-1", 50, 1_000, 550, "2026-08")
            .await
            .unwrap();
        let second = store
            .insert_alert(BudgetScope::Organization, "org-1", 50, 1_000, 700, "2026-08")
            .await
            .unwrap();
        assert!(first);
        assert!(!second);

        // New threshold or new period inserts again.
        assert!(
            store
                .insert_alert(BudgetScope::Organization, "org-1", 90, 1_000, 910, "2026-08")
                .await
                .unwrap()
        );
        assert!(
            store
                .insert_alert(BudgetScope::Organization, "org-1", 50, 1_000, 550, "2026-09")
                .await
                .unwrap()
        );

        assert_eq!(store.list_alerts().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn budget_upsert_and_nullable_ceiling() {
        let (_dir, store) = temp_store();
        assert!(
            store
                .load_budget(BudgetScope::Organization, "org-1")
                .await
                .unwrap()
                .is_none()
        );

        store
            .put_budget(&BudgetConfigRecord {
                scope: BudgetScope::Organization,
                scope_id: "org-1".to_string(),
                limit_usd_micros: Some(10_000_000),
            })
            .await
            .unwrap();
        let loaded = store
            .load_budget(BudgetScope::Organization, "org-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.limit_usd_micros, Some(10_000_000));

        // Null ceiling means unlimited, and upsert replaces the old value.
        store
            .put_budget(&BudgetConfigRecord {
                scope: BudgetScope::Organization,
                scope_id: "org-1".to_string(),
                limit_usd_micros: None,
            })
            .await
            .unwrap();
        let reloaded = store
            .load_budget(BudgetScope::Organization, "org-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.limit_usd_micros, None);
    }

    #[test]
    fn period_key_is_utc_calendar_month() {
        // 2026-08-25T00:00:00Z.
        assert_eq!(period_key_utc(1_787_616_000_000), "2026-08");
        assert_eq!(period_key_utc(0), "1970-01");
    }
}

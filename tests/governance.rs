use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use httpmock::Method::POST;
use httpmock::MockServer;
use serde_json::{Value, json};
use tower::util::ServiceExt;

use keymeter::{
    AppConfig, AppState, BudgetGovernor, BudgetScope, DEFAULT_THRESHOLD_LADDER, PriceSnapshot,
    PricingTable, RateLimitConfig, SqliteStore, UsageRecord, now_millis, period_key_utc, router,
};

const ADMIN_TOKEN: &str = "test-admin-token";
const UPSTREAM_SECRET: &str = "sk-real-upstream-secret";

fn test_config(dir: &tempfile::TempDir, upstream_url: String) -> AppConfig {
    let mut pricing = PricingTable::default();
    pricing.insert(
        "gpt-4o",
        PriceSnapshot {
            prompt_usd_micros_per_mtok: 2_500_000,
            completion_usd_micros_per_mtok: 10_000_000,
        },
    );
    AppConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        sqlite_path: dir.path().join("keymeter-test.db"),
        upstream_url,
        upstream_timeout: Duration::from_secs(5),
        master_key: [9u8; 32],
        pepper: vec![7u8; 32],
        admin_token: Some(ADMIN_TOKEN.to_string()),
        allowed_models: vec!["gpt-4o".to_string()],
        pricing,
        rate_limit: RateLimitConfig {
            max_requests: 100,
            window_secs: 60,
        },
        thresholds: DEFAULT_THRESHOLD_LADDER.to_vec(),
    }
}

async fn test_app(dir: &tempfile::TempDir, upstream_url: String) -> (Router, SqliteStore) {
    let config = test_config(dir, upstream_url);
    let state = AppState::from_config(&config).unwrap();
    state.store().init().await.unwrap();
    let store = state.store().clone();
    (router(state), store)
}

async fn response_json(response: axum::response::Response) -> Value {
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn issue_credential(app: &Router) -> String {
    let request = Request::builder()
        .method("POST")
        .uri("/admin/credentials")
        .header("x-admin-token", ADMIN_TOKEN)
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"org_id": "org-1", "project_id": "proj-1", "name": "ci"}).to_string(),
        ))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = response_json(response).await;
    body["secret"].as_str().unwrap().to_string()
}

async fn set_org_secret(app: &Router) {
    let request = Request::builder()
        .method("PUT")
        .uri("/admin/orgs/org-1/secret")
        .header("x-admin-token", ADMIN_TOKEN)
        .header("content-type", "application/json")
        .body(Body::from(json!({"secret": UPSTREAM_SECRET}).to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

async fn set_org_budget(app: &Router, limit_usd_micros: u64) {
    let request = Request::builder()
        .method("PUT")
        .uri("/admin/budgets")
        .header("x-admin-token", ADMIN_TOKEN)
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "scope": "organization",
                "scope_id": "org-1",
                "limit_usd_micros": limit_usd_micros
            })
            .to_string(),
        ))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

fn chat_request(secret: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", format!("Bearer {secret}"))
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "model": "gpt-4o",
                "messages": [{"role": "user", "content": "hello"}]
            })
            .to_string(),
        ))
        .unwrap()
}

async fn wait_for_alerts(store: &SqliteStore, expected: usize) -> Vec<keymeter::AlertRecord> {
    for _ in 0..200 {
        let alerts = store.list_alerts().await.unwrap();
        if alerts.len() >= expected {
            return alerts;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {expected} alerts");
}

#[tokio::test]
async fn threshold_alert_is_raised_after_a_metered_call() {
    let upstream = MockServer::start();
    upstream
        .mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            // $2.50 prompt + $3.00 completion = $5.50, which is 55% of a
            // $10 budget.
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "usage": {"prompt_tokens": 1_000_000, "completion_tokens": 300_000}
                }));
        });

    let dir = tempfile::tempdir().unwrap();
    let (app, store) = test_app(&dir, upstream.base_url()).await;
    let secret = issue_credential(&app).await;
    set_org_secret(&app).await;
    set_org_budget(&app, 10_000_000).await;

    let response = app.clone().oneshot(chat_request(&secret)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let alerts = wait_for_alerts(&store, 1).await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].scope, BudgetScope::Organization);
    assert_eq!(alerts[0].scope_id, "org-1");
    assert_eq!(alerts[0].threshold_pct, 50);
    assert_eq!(alerts[0].spend_usd_micros, 5_500_000);
    assert_eq!(alerts[0].limit_usd_micros, 10_000_000);

    // The alert is visible through the admin plane.
    let request = Request::builder()
        .method("GET")
        .uri("/admin/alerts")
        .header("x-admin-token", ADMIN_TOKEN)
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["threshold_pct"], 50);
}

#[tokio::test]
async fn concurrent_evaluations_emit_exactly_one_alert() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::new(dir.path().join("concurrent.db"));
    store.init().await.unwrap();
    store
        .put_budget(&keymeter::BudgetConfigRecord {
            scope: BudgetScope::Organization,
            scope_id: "org-1".to_string(),
            limit_usd_micros: Some(1_000_000),
        })
        .await
        .unwrap();

    let created_at_ms = now_millis();
    store
        .append_usage(&UsageRecord {
            trace_id: "trace-1".to_string(),
            org_id: "org-1".to_string(),
            project_id: "proj-1".to_string(),
            credential_id: "cred-1".to_string(),
            model: "gpt-4o".to_string(),
            prompt_tokens: 1,
            completion_tokens: 1,
            cost_usd_micros: 700_000,
            prompt_usd_micros_per_mtok: 0,
            completion_usd_micros_per_mtok: 0,
            currency: "USD".to_string(),
            status: "success".to_string(),
            created_at_ms,
            period: period_key_utc(created_at_ms),
        })
        .await
        .unwrap();

    let governor = BudgetGovernor::new(store.clone(), DEFAULT_THRESHOLD_LADDER.to_vec());
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let governor = governor.clone();
        tasks.push(tokio::spawn(async move {
            governor.evaluate("org-1", None).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let alerts = store.list_alerts().await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].threshold_pct, 50);
}

#[tokio::test]
async fn governance_failure_never_reaches_the_response() {
    let upstream = MockServer::start();
    upstream
        .mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "usage": {"prompt_tokens": 100, "completion_tokens": 100}
                }));
        });

    let dir = tempfile::tempdir().unwrap();
    let (app, store) = test_app(&dir, upstream.base_url()).await;
    let secret = issue_credential(&app).await;
    set_org_secret(&app).await;

    // Make every ledger append fail after the response has been determined,
    // leaving the rest of the schema intact.
    {
        let conn = rusqlite::Connection::open(store.path()).unwrap();
        conn.execute_batch(
            "CREATE TRIGGER usage_records_sealed BEFORE INSERT ON usage_records
             BEGIN SELECT RAISE(ABORT, 'sealed'); END;",
        )
        .unwrap();
    }

    let response = app.clone().oneshot(chat_request(&secret)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["usage"]["prompt_tokens"], 100);

    // The failed write is contained; nothing downstream alerts or retries.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(store.list_alerts().await.unwrap().is_empty());
}

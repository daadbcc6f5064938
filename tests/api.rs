#![cfg(feature = "dashboard")]

use reqwest::StatusCode;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;

use tally::config::{Settings, SETTING_REFRESH_INTERVAL};
use tally::crypto::Vault;
use tally::dashboard::{self, AppState};
use tally::device_flow::DeviceFlow;
use tally::reconcile::{Providers, Reconciler};
use tally::scheduler::Scheduler;
use tally::store::Store;

const UNREACHABLE: &str = "http://127.0.0.1:9";

struct TestApi {
    base: String,
    http: reqwest::Client,
    reconciler: Arc<Reconciler>,
}

impl TestApi {
    async fn start() -> Self {
        Self::start_with_anthropic(UNREACHABLE).await
    }

    async fn start_with_anthropic(anthropic_api_base: &str) -> Self {
        let settings = Settings {
            github_api_base: UNREACHABLE.into(),
            github_web_base: UNREACHABLE.into(),
            anthropic_api_base: anthropic_api_base.into(),
            anthropic_token_url: format!("{UNREACHABLE}/v1/oauth/token"),
            http_timeout: std::time::Duration::from_secs(2),
            ..Settings::default()
        };
        let reconciler = Arc::new(Reconciler::new(
            Arc::new(Store::open_in_memory().unwrap()),
            Arc::new(Vault::from_secret(b"api-test").unwrap()),
            Providers::http(&settings).unwrap(),
        ));
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&reconciler)));
        let device_flow = DeviceFlow::new(reqwest::Client::new(), UNREACHABLE, None);
        let state = AppState::new(&settings, Arc::clone(&reconciler), scheduler, device_flow);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = dashboard::router(state);
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        Self {
            base: format!("http://{addr}"),
            http: reqwest::Client::new(),
            reconciler,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn create(&self, body: Value) -> reqwest::Response {
        self.http
            .post(self.url("/api/accounts"))
            .json(&body)
            .send()
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn thirty_first_mutation_is_rate_limited() {
    let api = TestApi::start().await;
    let body = json!({ "account_type": "copilot", "token": "" });

    for i in 0..30 {
        let resp = api
            .http
            .post(api.url("/api/verify"))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK, "request {}", i + 1);
    }

    let blocked = api
        .http
        .post(api.url("/api/verify"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(blocked.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = blocked.headers()["retry-after"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=60).contains(&retry_after));

    let read = api.http.get(api.url("/api/accounts")).send().await.unwrap();
    assert_eq!(read.status(), StatusCode::OK);
}

#[tokio::test]
async fn forwarded_clients_are_limited_separately() {
    let api = TestApi::start().await;
    let body = json!({ "account_type": "claude_code", "token": " " });
    let verify = |client: &'static str| {
        api.http
            .post(api.url("/api/verify"))
            .header("x-forwarded-for", client)
            .json(&body)
            .send()
    };

    for _ in 0..30 {
        verify("203.0.113.1").await.unwrap();
    }
    assert_eq!(
        verify("203.0.113.1").await.unwrap().status(),
        StatusCode::TOO_MANY_REQUESTS
    );
    assert_eq!(
        verify("203.0.113.2, 10.0.0.1").await.unwrap().status(),
        StatusCode::OK
    );
}

#[tokio::test]
async fn verify_reports_empty_credential() {
    let api = TestApi::start().await;
    let resp: Value = api
        .http
        .post(api.url("/api/verify"))
        .json(&json!({ "account_type": "copilot", "token": "" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["valid"], false);
    assert_eq!(resp["error"], "credential is empty");
}

#[tokio::test]
async fn account_lifecycle_never_exposes_secrets() {
    let api = TestApi::start().await;
    let secret = "ghp_super_secret_value";

    let created = api
        .create(json!({
            "account_type": "copilot",
            "username": "octocat",
            "token": secret,
            "plan": "pro_plus",
            "verify": false
        }))
        .await;
    assert_eq!(created.status(), StatusCode::CREATED);
    let created: Value = created.json().await.unwrap();
    let id = created["id"].as_i64().unwrap();
    assert_eq!(created["plan"], "pro_plus");
    assert_eq!(created["has_credential"], true);

    let stored = api.reconciler.store().get_account(id).unwrap().unwrap();
    match &stored.kind {
        tally::models::AccountKind::Copilot { pat_token, .. } => {
            assert_ne!(pat_token, secret);
            assert_eq!(api.reconciler.vault().decrypt(pat_token), secret);
        }
        other => panic!("unexpected kind {other:?}"),
    }

    let duplicate = api
        .create(json!({
            "account_type": "copilot",
            "username": "octocat",
            "token": "ghp_other",
            "verify": false
        }))
        .await;
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);

    let listing = api
        .http
        .get(api.url("/api/accounts"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(!listing.contains(secret));
    let accounts: Value = serde_json::from_str(&listing).unwrap();
    assert_eq!(accounts.as_array().unwrap().len(), 1);

    let patched: Value = api
        .http
        .patch(api.url(&format!("/api/accounts/{id}")))
        .json(&json!({ "is_paused": true, "display_name": "Mona", "billing_org": "acme" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(patched["is_paused"], true);
    assert_eq!(patched["display_name"], "Mona");
    assert_eq!(patched["billing_org"], "acme");

    let bad_plan = api
        .http
        .patch(api.url(&format!("/api/accounts/{id}")))
        .json(&json!({ "plan": "platinum" }))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_plan.status(), StatusCode::BAD_REQUEST);

    let deleted = api
        .http
        .delete(api.url(&format!("/api/accounts/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), StatusCode::NO_CONTENT);
    let again = api
        .http
        .delete(api.url(&format!("/api/accounts/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn created_claude_web_account_takes_plan_from_profile() {
    let profile = axum::Router::new().route(
        "/api/oauth/profile",
        axum::routing::get(|| async {
            axum::Json(json!({
                "account": { "email": "me@example.com", "display_name": "Me", "has_claude_pro": true }
            }))
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let anthropic = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move { axum::serve(listener, profile).await.unwrap() });

    let api = TestApi::start_with_anthropic(&anthropic).await;
    let created = api
        .create(json!({
            "account_type": "claude_web",
            "username": "me@example.com",
            "token": "sk-ant-oat-good"
        }))
        .await;
    assert_eq!(created.status(), StatusCode::CREATED);
    let created: Value = created.json().await.unwrap();
    assert_eq!(created["plan"], "pro");
    assert_eq!(created["display_name"], "Me");

    let explicit: Value = api
        .create(json!({
            "account_type": "claude_web",
            "username": "other@example.com",
            "token": "sk-ant-oat-good",
            "plan": "max",
            "display_name": "Work",
            "verify": false
        }))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(explicit["plan"], "max");
    assert_eq!(explicit["display_name"], "Work");
}

#[tokio::test]
async fn create_rejects_missing_fields() {
    let api = TestApi::start().await;
    let no_user = api
        .create(json!({
            "account_type": "copilot",
            "username": " ",
            "token": "x",
            "verify": false
        }))
        .await;
    assert_eq!(no_user.status(), StatusCode::BAD_REQUEST);

    let no_token = api
        .create(json!({
            "account_type": "claude_web",
            "username": "me",
            "token": "",
            "verify": false
        }))
        .await;
    assert_eq!(no_token.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn refreshing_unknown_account_is_not_found() {
    let api = TestApi::start().await;
    let resp = api
        .http
        .post(api.url("/api/accounts/999/refresh"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "account 999 not found");
}

#[tokio::test]
async fn refresh_interval_is_clamped_and_persisted() {
    let api = TestApi::start().await;
    let resp: Value = api
        .http
        .put(api.url("/api/settings/refresh-interval"))
        .json(&json!({ "minutes": 0 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["minutes"], 1);
    assert_eq!(
        api.reconciler
            .store()
            .get_setting(SETTING_REFRESH_INTERVAL)
            .unwrap()
            .as_deref(),
        Some("1")
    );
}

#[tokio::test]
async fn device_flow_requires_client_id() {
    let api = TestApi::start().await;
    let resp = api
        .http
        .post(api.url("/api/device/start"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn responses_carry_security_headers() {
    let api = TestApi::start().await;
    let resp = api.http.get(api.url("/api/accounts")).send().await.unwrap();
    let headers = resp.headers();
    assert_eq!(headers["x-frame-options"], "DENY");
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert_eq!(headers["cache-control"], "no-store");
}

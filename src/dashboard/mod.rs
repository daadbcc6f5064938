//! Local JSON API over accounts, usage, verification and refresh control.

mod handlers;
pub mod types;

use anyhow::{Context, Result};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderValue, Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post, put};
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;

use crate::config::Settings;
use crate::device_flow::DeviceFlow;
use crate::rate_limit::{client_ip, retry_after_secs, Decision, RateLimiter};
use crate::reconcile::Reconciler;
use crate::scheduler::Scheduler;

#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<Reconciler>,
    pub scheduler: Arc<Scheduler>,
    pub device_flow: Arc<DeviceFlow>,
    pub rate_limiter: Arc<RateLimiter>,
    /// Header carrying the client address when behind a proxy.
    pub trusted_proxy_header: Arc<str>,
}

impl AppState {
    pub fn new(
        settings: &Settings,
        reconciler: Arc<Reconciler>,
        scheduler: Arc<Scheduler>,
        device_flow: DeviceFlow,
    ) -> Self {
        Self {
            reconciler,
            scheduler,
            device_flow: Arc::new(device_flow),
            rate_limiter: Arc::new(RateLimiter::new(settings.rate_limit.clone())),
            trusted_proxy_header: Arc::from(settings.trusted_proxy_header.to_ascii_lowercase()),
        }
    }
}

/// The API routes with rate limiting and security headers, without CORS.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/accounts",
            get(handlers::list_accounts).post(handlers::create_account),
        )
        .route(
            "/api/accounts/{id}",
            patch(handlers::update_account).delete(handlers::delete_account),
        )
        .route("/api/accounts/{id}/refresh", post(handlers::refresh_account))
        .route("/api/refresh", post(handlers::refresh_all))
        .route("/api/verify", post(handlers::verify))
        .route(
            "/api/settings/refresh-interval",
            put(handlers::set_refresh_interval),
        )
        .route("/api/device/start", post(handlers::device_start))
        .route("/api/device/poll", post(handlers::device_poll))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

pub async fn run(state: AppState, port: u16) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("cannot bind 127.0.0.1:{port}"))?;
    let actual_port = listener.local_addr()?.port();

    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{actual_port}"),
        format!("http://localhost:{actual_port}"),
    ]
    .iter()
    .filter_map(|o| HeaderValue::from_str(o).ok())
    .collect();
    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

    let sweeper = spawn_sweeper(&state);
    let app = router(state).layer(cors);

    tracing::info!(port = actual_port, "api listening on http://127.0.0.1:{actual_port}");
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;
    sweeper.abort();
    served.context("api server failed")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

/// Periodically drop expired rate-limit windows and device sessions.
fn spawn_sweeper(state: &AppState) -> tokio::task::JoinHandle<()> {
    let limiter = Arc::clone(&state.rate_limiter);
    let device_flow = Arc::clone(&state.device_flow);
    let every = limiter.config().window.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let windows = limiter.sweep();
            let sessions = device_flow.sweep();
            if windows + sessions > 0 {
                tracing::debug!(windows, sessions, "swept expired entries");
            }
        }
    })
}

fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

async fn rate_limit(
    State(state): State<AppState>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if !is_mutating(req.method()) {
        return next.run(req).await;
    }
    let forwarded = req
        .headers()
        .get(&*state.trusted_proxy_header)
        .and_then(|v| v.to_str().ok());
    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let client = client_ip(forwarded, remote);

    match state.rate_limiter.check(&client) {
        Decision::Allowed { .. } => next.run(req).await,
        Decision::Blocked { retry_after } => {
            let secs = retry_after_secs(retry_after);
            tracing::warn!(client = %client, retry_after = secs, "rate limit exceeded");
            (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, secs.to_string())],
                Json(serde_json::json!({ "error": "too many requests" })),
            )
                .into_response()
        }
    }
}

async fn security_headers(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

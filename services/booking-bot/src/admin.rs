//! Operator API
//!
//! Runs on its own listener (default 127.0.0.1:9090).
//!
//! Endpoints:
//! - GET  /health         : liveness plus breaker state (no auth)
//! - GET  /metrics        : Prometheus text exposition (no auth)
//! - GET  /admin/pool     : account pool status, never credentials
//! - GET  /admin/breaker  : circuit breaker stats
//! - POST /admin/trigger  : end the loop's current wait early
//!
//! `/admin/*` requires `Authorization: Bearer <token>`. Every attempt is
//! first counted against the caller's IP in the rate limiter; a limited
//! caller gets 429 before the token is looked at.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use account_pool::AccountPool;
use axum::Router;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use circuit_breaker::{BreakerState, CircuitBreaker};
use common::Secret;
use metrics_exporter_prometheus::PrometheusHandle;
use rate_limit::RateLimiter;
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::control::LoopSignals;

/// Attempt budget per client IP for admin authentication.
#[derive(Debug, Clone)]
pub struct AuthLimit {
    pub max_attempts: u32,
    pub window: Duration,
}

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    pool: Arc<AccountPool>,
    breaker: Arc<CircuitBreaker>,
    signals: LoopSignals,
    limiter: Arc<dyn RateLimiter>,
    /// SHA-256 of the configured token; `None` disables `/admin/*`
    token_digest: Option<Arc<Secret<Vec<u8>>>>,
    auth_limit: AuthLimit,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

impl AdminState {
    pub fn new(
        pool: Arc<AccountPool>,
        breaker: Arc<CircuitBreaker>,
        signals: LoopSignals,
        limiter: Arc<dyn RateLimiter>,
        token: Option<&Secret<String>>,
        auth_limit: AuthLimit,
        prometheus: PrometheusHandle,
    ) -> Self {
        Self {
            pool,
            breaker,
            signals,
            limiter,
            token_digest: token.map(|t| Arc::new(Secret::new(digest(t.expose())))),
            auth_limit,
            prometheus,
            started_at: Instant::now(),
        }
    }
}

fn digest(value: &str) -> Vec<u8> {
    Sha256::digest(value.as_bytes()).to_vec()
}

/// Build the admin router: open routes plus the authenticated `/admin` group.
pub fn build_admin_router(state: AdminState, max_connections: usize) -> Router {
    let protected = Router::new()
        .route("/admin/pool", get(pool_status))
        .route("/admin/breaker", get(breaker_status))
        .route("/admin/trigger", post(trigger))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .merge(protected)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn client_ip(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Rate-limit, then check the bearer token by digest.
async fn require_token(State(state): State<AdminState>, request: Request, next: Next) -> Response {
    let Some(expected) = state.token_digest.as_ref() else {
        return json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({ "error": "admin API disabled: no admin token configured" }),
        );
    };

    let ip = client_ip(&request);
    let identifier = format!("admin-auth:{ip}");
    match state
        .limiter
        .check_and_record(
            &identifier,
            state.auth_limit.max_attempts,
            state.auth_limit.window,
        )
        .await
    {
        Ok(false) => {}
        Ok(true) => {
            warn!(client_ip = %ip, "Admin authentication rate limited");
            return json_response(
                StatusCode::TOO_MANY_REQUESTS,
                serde_json::json!({ "error": "too many authentication attempts" }),
            );
        }
        Err(e) => {
            error!(client_ip = %ip, error = %e, "Rate limiter unavailable for admin auth");
            return json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({ "error": "rate limiter unavailable" }),
            );
        }
    }

    let presented = bearer_token(&request).map(digest);
    if presented.as_deref() != Some(expected.expose().as_slice()) {
        warn!(client_ip = %ip, "Admin authentication failed");
        return json_response(
            StatusCode::UNAUTHORIZED,
            serde_json::json!({ "error": "invalid or missing bearer token" }),
        );
    }

    if let Err(e) = state.limiter.clear_attempts(&identifier).await {
        warn!(client_ip = %ip, error = %e, "Failed to clear admin auth attempts");
    }
    next.run(request).await
}

/// GET /health: 200 while the breaker admits work, 503 while it is open.
async fn health(State(state): State<AdminState>) -> Response {
    let breaker = state.breaker.state();
    let (status, label) = match breaker {
        BreakerState::Open => (StatusCode::SERVICE_UNAVAILABLE, "degraded"),
        _ => (StatusCode::OK, "healthy"),
    };
    json_response(
        status,
        serde_json::json!({
            "status": label,
            "breaker": breaker.label(),
            "rate_limit_backend": state.limiter.backend(),
            "shutting_down": state.signals.is_shutdown(),
            "uptime_seconds": state.started_at.elapsed().as_secs(),
        }),
    )
}

/// GET /metrics: Prometheus text exposition format.
async fn metrics_handler(State(state): State<AdminState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// GET /admin/pool
async fn pool_status(State(state): State<AdminState>) -> Response {
    match state.pool.get_pool_status().await {
        Ok(status) => match serde_json::to_value(&status) {
            Ok(body) => json_response(StatusCode::OK, body),
            Err(e) => json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": e.to_string() }),
            ),
        },
        Err(e) => {
            error!(error = %e, "Failed to read pool status");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": e.to_string() }),
            )
        }
    }
}

/// GET /admin/breaker
async fn breaker_status(State(state): State<AdminState>) -> Response {
    let stats = state.breaker.get_stats();
    match serde_json::to_value(&stats) {
        Ok(mut body) => {
            body["name"] = serde_json::Value::from(state.breaker.name());
            json_response(StatusCode::OK, body)
        }
        Err(e) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": e.to_string() }),
        ),
    }
}

/// POST /admin/trigger
async fn trigger(State(state): State<AdminState>) -> Response {
    if state.signals.is_shutdown() {
        return json_response(
            StatusCode::CONFLICT,
            serde_json::json!({ "error": "shutting down" }),
        );
    }
    state.signals.trigger_now();
    info!("Immediate run triggered via admin API");
    json_response(
        StatusCode::ACCEPTED,
        serde_json::json!({ "triggered": true }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use account_pool::{Account, MemoryRepository, PoolConfig};
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use circuit_breaker::BreakerConfig;
    use rate_limit::MemoryRateLimiter;
    use tower::ServiceExt;

    const TOKEN: &str = "s3cret-admin-token";

    fn test_prometheus_handle() -> PrometheusHandle {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle()
    }

    struct Fixture {
        state: AdminState,
        breaker: Arc<CircuitBreaker>,
        limiter: Arc<MemoryRateLimiter>,
    }

    fn fixture(token: Option<&str>) -> Fixture {
        let repository = Arc::new(MemoryRepository::new(vec![
            Account::new("acct-1", "vault://acct-1"),
            Account::new("acct-2", "vault://acct-2"),
        ]));
        let pool = Arc::new(AccountPool::new(repository, PoolConfig::default()));
        let breaker = Arc::new(CircuitBreaker::new(
            "booking-site",
            BreakerConfig {
                failure_threshold: 1,
                ..BreakerConfig::default()
            },
        ));
        let limiter = Arc::new(MemoryRateLimiter::new());
        let token = token.map(Secret::from);
        let state = AdminState::new(
            pool,
            breaker.clone(),
            LoopSignals::new(),
            limiter.clone(),
            token.as_ref(),
            AuthLimit {
                max_attempts: 3,
                window: Duration::from_secs(300),
            },
            test_prometheus_handle(),
        );
        Fixture {
            state,
            breaker,
            limiter,
        }
    }

    fn request(method: &str, uri: &str, token: Option<&str>, ip: [u8; 4]) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let mut request = builder.body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((ip, 40000))));
        request
    }

    async fn send(
        state: &AdminState,
        request: HttpRequest<Body>,
    ) -> (StatusCode, serde_json::Value) {
        let response = build_admin_router(state.clone(), 16)
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn health_requires_no_auth() {
        let f = fixture(Some(TOKEN));
        let (status, json) = send(&f.state, request("GET", "/health", None, [10, 0, 0, 1])).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["breaker"], "closed");
        assert_eq!(json["rate_limit_backend"], "memory");
    }

    #[tokio::test]
    async fn health_degraded_while_breaker_open() {
        let f = fixture(Some(TOKEN));
        f.breaker.record_failure();
        let (status, json) = send(&f.state, request("GET", "/health", None, [10, 0, 0, 1])).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["breaker"], "open");
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_format() {
        let f = fixture(Some(TOKEN));
        let response = build_admin_router(f.state.clone(), 16)
            .oneshot(request("GET", "/metrics", None, [10, 0, 0, 1]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get("content-type").unwrap();
        assert!(content_type.to_str().unwrap().starts_with("text/plain"));
    }

    #[tokio::test]
    async fn pool_status_requires_token() {
        let f = fixture(Some(TOKEN));
        let (status, _) = send(&f.state, request("GET", "/admin/pool", None, [10, 0, 0, 2])).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(
            &f.state,
            request("GET", "/admin/pool", Some("wrong"), [10, 0, 0, 2]),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn pool_status_never_exposes_credentials() {
        let f = fixture(Some(TOKEN));
        let (status, json) = send(
            &f.state,
            request("GET", "/admin/pool", Some(TOKEN), [10, 0, 0, 3]),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["total"], 2);
        assert_eq!(json["available"], 2);
        assert_eq!(json["accounts"].as_array().unwrap().len(), 2);
        assert!(!json.to_string().contains("vault://"));
    }

    #[tokio::test]
    async fn breaker_stats_endpoint() {
        let f = fixture(Some(TOKEN));
        let (status, json) = send(
            &f.state,
            request("GET", "/admin/breaker", Some(TOKEN), [10, 0, 0, 4]),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["name"], "booking-site");
        assert_eq!(json["state"], "CLOSED");
        assert_eq!(json["failure_count"], 0);
    }

    #[tokio::test]
    async fn trigger_wakes_loop_wait() {
        let f = fixture(Some(TOKEN));
        let (status, json) = send(
            &f.state,
            request("POST", "/admin/trigger", Some(TOKEN), [10, 0, 0, 5]),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(json["triggered"], true);

        let outcome = f.state.signals.wait(Duration::from_secs(3600)).await;
        assert_eq!(outcome, crate::control::WaitOutcome::Triggered);
    }

    #[tokio::test]
    async fn trigger_rejected_during_shutdown() {
        let f = fixture(Some(TOKEN));
        f.state.signals.request_shutdown();
        let (status, _) = send(
            &f.state,
            request("POST", "/admin/trigger", Some(TOKEN), [10, 0, 0, 5]),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn repeated_failures_are_rate_limited_per_ip() {
        let f = fixture(Some(TOKEN));
        let attacker = [192, 0, 2, 7];
        for _ in 0..3 {
            let (status, _) =
                send(&f.state, request("GET", "/admin/pool", Some("guess"), attacker)).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
        }

        // Limited callers are refused even with the right token.
        let limited = request("GET", "/admin/pool", Some(TOKEN), attacker);
        let (status, _) = send(&f.state, limited).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

        // Other clients are unaffected.
        let (status, _) = send(
            &f.state,
            request("GET", "/admin/pool", Some(TOKEN), [10, 0, 0, 9]),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn successful_auth_clears_attempts() {
        let f = fixture(Some(TOKEN));
        let ip = [10, 0, 0, 10];
        for _ in 0..2 {
            send(&f.state, request("GET", "/admin/pool", Some("typo"), ip)).await;
        }
        let (status, _) = send(&f.state, request("GET", "/admin/pool", Some(TOKEN), ip)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(f.limiter.tracked_identifiers(), 0);

        // A fresh budget after success.
        for _ in 0..2 {
            let (status, _) = send(&f.state, request("GET", "/admin/pool", Some("typo"), ip)).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
        }
    }

    #[tokio::test]
    async fn admin_disabled_without_token() {
        let f = fixture(None);
        let (status, json) = send(
            &f.state,
            request("GET", "/admin/pool", Some(TOKEN), [10, 0, 0, 11]),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(json["error"].as_str().unwrap().contains("disabled"));
    }
}

//! HTTP routing configuration with rate limiting and OpenAPI documentation.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    extract::{ConnectInfo, DefaultBodyLimit, State},
    http::{HeaderValue, Request, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use governor::{Quota, RateLimiter};
use tower::ServiceBuilder;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::Level;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::app::AppState;
use crate::config::RateLimitConfig;
use crate::domain::{ErrorDetail, ErrorKind, ErrorResponse, RateLimitResponse};

use super::handlers::{
    ApiDoc, announce_item_handler, create_item_handler, get_image_handler, get_item_handler,
    health_check_handler, list_items_handler, liveness_handler, metrics_handler,
    readiness_handler, upload_image_handler, version_handler,
};
use super::middleware::auth_middleware;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type KeyedLimiter = RateLimiter<
    IpAddr,
    governor::state::keyed::DashMapStateStore<IpAddr>,
    governor::clock::DefaultClock,
>;

/// Shared rate limiter state, keyed by client IP.
pub struct RateLimitState {
    items_limiter: KeyedLimiter,
    health_limiter: KeyedLimiter,
    config: RateLimitConfig,
}

fn non_zero(value: u32) -> NonZeroU32 {
    NonZeroU32::new(value).unwrap_or(NonZeroU32::MIN)
}

impl RateLimitState {
    pub fn new(config: RateLimitConfig) -> Self {
        let items_quota =
            Quota::per_second(non_zero(config.general_rps)).allow_burst(non_zero(config.general_burst));
        let health_quota =
            Quota::per_second(non_zero(config.health_rps)).allow_burst(non_zero(config.health_burst));

        Self {
            items_limiter: RateLimiter::dashmap(items_quota),
            health_limiter: RateLimiter::dashmap(health_quota),
            config,
        }
    }
}

/// Client IP from X-Forwarded-For, X-Real-IP or the connection address.
/// Unknown clients share the 0.0.0.0 bucket.
fn client_ip_from_request<B>(request: &Request<B>) -> IpAddr {
    let header_ip = |name: &str, first_of_list: bool| {
        request
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| {
                let candidate = if first_of_list { s.split(',').next()? } else { s };
                candidate.trim().parse::<IpAddr>().ok()
            })
    };

    if let Some(ip) = header_ip("x-forwarded-for", true) {
        return ip;
    }
    if let Some(ip) = header_ip("x-real-ip", false) {
        return ip;
    }
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        return addr.ip();
    }
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn retry_after_secs(not_until: &governor::NotUntil<governor::clock::QuantaInstant>) -> u64 {
    let wait = not_until.wait_time_from(governor::clock::Clock::now(
        &governor::clock::DefaultClock::default(),
    ));
    wait.as_secs().max(1)
}

async fn rate_limit_items_middleware(
    State(rate_limit): State<Arc<RateLimitState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let client_ip = client_ip_from_request(&request);
    let limit = HeaderValue::from(rate_limit.config.general_rps);

    match rate_limit.items_limiter.check_key(&client_ip) {
        Ok(_) => {
            let mut response = next.run(request).await;
            response.headers_mut().insert("X-RateLimit-Limit", limit);
            response
        }
        Err(not_until) => {
            let retry_after = retry_after_secs(&not_until);
            let body = RateLimitResponse {
                error: ErrorDetail {
                    r#type: ErrorKind::RateLimited.as_str().to_string(),
                    message: "Rate limit exceeded. Please slow down your requests.".to_string(),
                },
                retry_after,
            };

            let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
            let headers = response.headers_mut();
            headers.insert("X-RateLimit-Limit", limit);
            headers.insert("X-RateLimit-Remaining", HeaderValue::from_static("0"));
            headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
            response
        }
    }
}

async fn rate_limit_health_middleware(
    State(rate_limit): State<Arc<RateLimitState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let client_ip = client_ip_from_request(&request);
    match rate_limit.health_limiter.check_key(&client_ip) {
        Ok(_) => next.run(request).await,
        Err(not_until) => {
            let retry_after = retry_after_secs(&not_until);
            let body = ErrorResponse {
                error: ErrorDetail {
                    r#type: ErrorKind::RateLimited.as_str().to_string(),
                    message: "Rate limit exceeded".to_string(),
                },
            };

            let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
            response
        }
    }
}

fn build_router(app_state: Arc<AppState>, rate_limit: Option<Arc<RateLimitState>>) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            REQUEST_TIMEOUT,
        ));

    let upload_limit = DefaultBodyLimit::max(app_state.upload_body_limit());

    let mut items_routes = Router::new()
        .route("/", post(create_item_handler).get(list_items_handler))
        .route("/{id}", get(get_item_handler))
        .route(
            "/{id}/image",
            post(upload_image_handler)
                .layer(upload_limit)
                .get(get_image_handler),
        )
        .route("/{id}/announce", post(announce_item_handler))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&app_state),
            auth_middleware,
        ));

    let mut health_routes = Router::new()
        .route("/", get(health_check_handler))
        .route("/live", get(liveness_handler))
        .route("/ready", get(readiness_handler));

    if let Some(rate_limit) = rate_limit {
        items_routes = items_routes.layer(middleware::from_fn_with_state(
            Arc::clone(&rate_limit),
            rate_limit_items_middleware,
        ));
        health_routes = health_routes.layer(middleware::from_fn_with_state(
            rate_limit,
            rate_limit_health_middleware,
        ));
    }

    Router::new()
        .nest("/items", items_routes)
        .nest("/health", health_routes)
        .route("/metrics", get(metrics_handler))
        .route("/version", get(version_handler))
        .layer(middleware)
        .with_state(app_state)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
}

/// Create router without rate limiting
pub fn create_router(app_state: Arc<AppState>) -> Router {
    build_router(app_state, None)
}

/// Create router with per-IP rate limiting on item and health routes
pub fn create_router_with_rate_limit(app_state: Arc<AppState>, config: RateLimitConfig) -> Router {
    build_router(app_state, Some(Arc::new(RateLimitState::new(config))))
}

use crate::api::handlers::reset::{
    AuditLogger, CsrfGuard, CsrfStore, FixedWindowLimiter, MinLengthPolicy, PgAuditSink,
    PgCsrfStore, PgRateLimitStore, PgTokenStore, PgUserStore, RateLimitStore, ResetConfig,
    ResetFlow, ResetState, TokenIssuer, TokenStore, spawn_purge_worker,
};
use anyhow::{Context, Result, anyhow};
use axum::{
    Extension,
    body::Body,
    extract::MatchedPath,
    http::{
        HeaderName, HeaderValue, Method, Request,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
    routing::options,
};
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{Span, info, info_span};
use ulid::Ulid;
use url::Url;
use utoipa_axum::router::OpenApiRouter;

// Keep these internal to the crate while allowing CLI/server wiring to reference them.
pub(crate) mod email;
pub(crate) mod handlers;
// OpenAPI router wiring and route registration live in openapi.rs.
mod openapi;

pub use openapi::openapi;

/// Expired token/counter rows are reaped on this cadence.
const PURGE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Build the API router with all documented routes registered.
#[must_use]
pub fn router() -> OpenApiRouter {
    openapi::api_router()
}

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(
    port: u16,
    dsn: String,
    reset_config: ResetConfig,
    email_config: email::EmailWorkerConfig,
) -> Result<()> {
    // Connect to database
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&dsn)
        .await
        .context("Failed to connect to database")?;

    // All shared state funnels through store traits so deployments (and
    // tests) can swap the backing implementations.
    let token_store: Arc<dyn TokenStore> = Arc::new(PgTokenStore::new(pool.clone()));
    let csrf_store: Arc<dyn CsrfStore> = Arc::new(PgCsrfStore::new(pool.clone()));
    let limit_store: Arc<dyn RateLimitStore> = Arc::new(PgRateLimitStore::new(pool.clone()));

    let limiter = FixedWindowLimiter::new(
        limit_store.clone(),
        reset_config.rate_limit_ip_max(),
        reset_config.rate_limit_email_max(),
        reset_config.rate_limit_window(),
    );
    let tokens = TokenIssuer::new(token_store.clone(), reset_config.token_ttl());
    let csrf = CsrfGuard::new(
        csrf_store.clone(),
        reset_config.csrf_ttl(),
        reset_config.csrf_protection_enabled(),
    );
    let audit = AuditLogger::new(Arc::new(PgAuditSink::new(pool.clone())));

    let flow = ResetFlow::new(
        reset_config.clone(),
        limiter,
        tokens,
        csrf,
        audit,
        Arc::new(PgUserStore::new(pool.clone())),
        Arc::new(MinLengthPolicy::default()),
        Arc::new(email::OutboxMailer::new(pool.clone())),
    );

    let rate_limit_window = reset_config.rate_limit_window();
    let frontend_base_url = reset_config.frontend_base_url().to_string();
    let reset_state = Arc::new(ResetState::new(reset_config, flow));

    // Background worker polls email_outbox (DB-backed queue) for pending rows,
    // delivers/logs them, and retries failures with exponential backoff.
    email::spawn_outbox_worker(pool.clone(), Arc::new(email::LogEmailSender), email_config);

    // Second background task bounds table growth; validation-time expiry
    // checks never depend on it.
    spawn_purge_worker(
        token_store,
        csrf_store,
        limit_store,
        rate_limit_window,
        PURGE_INTERVAL,
    );

    let frontend_origin = frontend_origin(&frontend_base_url)?;
    let cors = CorsLayer::new()
        .allow_headers([
            CONTENT_TYPE,
            AUTHORIZATION,
            HeaderName::from_static("x-session-id"),
        ])
        .allow_methods([Method::GET, Method::POST])
        .allow_origin(AllowOrigin::exact(frontend_origin))
        .allow_credentials(true);

    // Build the router from OpenAPI-wired routes, then extend it with non-doc
    // routes like preflight-only `OPTIONS /health`. The spec stays in
    // openapi.rs for the `openapi` binary.
    let (router, _openapi) = router().split_for_parts();
    let app = router
        .route("/health", options(handlers::health::health))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(cors)
                .layer(Extension(reset_state.clone()))
                .layer(Extension(pool.clone())),
        )
        .layer(Extension(pool));

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Gracefully shutdown");
        })
        .await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

fn frontend_origin(frontend_base_url: &str) -> Result<HeaderValue> {
    let parsed = Url::parse(frontend_base_url)
        .with_context(|| format!("Invalid frontend base URL: {frontend_base_url}"))?;
    let host = parsed.host_str().ok_or_else(|| {
        anyhow!("Frontend base URL must include a valid host: {frontend_base_url}")
    })?;
    let port = parsed
        .port()
        .map_or_else(String::new, |port| format!(":{port}"));
    let origin = format!("{}://{}{}", parsed.scheme(), host, port);
    HeaderValue::from_str(&origin).context("Failed to build frontend origin header")
}

#[cfg(test)]
mod tests {
    use super::frontend_origin;

    #[test]
    fn frontend_origin_strips_path_and_keeps_port() {
        let origin = frontend_origin("https://restarigi.dev/reset/").expect("origin");
        assert_eq!(origin, "https://restarigi.dev");

        let origin = frontend_origin("http://localhost:5173").expect("origin");
        assert_eq!(origin, "http://localhost:5173");
    }

    #[test]
    fn frontend_origin_rejects_garbage() {
        assert!(frontend_origin("not a url").is_err());
    }
}

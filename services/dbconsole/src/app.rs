//! Console HTTP application wiring.
//!
//! # Purpose
//! Builds the shared state (broker, gate, registries, coordinator) over a
//! backend, composes the Axum router with its middleware, and runs the
//! background reapers.
use crate::access::cache::{AccessCache, BrokerAccessSource};
use crate::access::gate::AccessGate;
use crate::api;
use crate::api::openapi::ApiDoc;
use crate::api::{ConsoleRequestIds, REQUEST_ID_HEADER};
use crate::auth::{CookieKey, CookiePolicy, Sealer, SessionRegistry};
use crate::backend::Backend;
use crate::broker::ConnectionBroker;
use crate::clock::SharedClock;
use crate::config::ConsoleConfig;
use crate::coordinator::Coordinator;
use crate::observability;
use crate::txn::TransactionManager;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing_opentelemetry::OpenTelemetrySpanExt;
use utoipa::OpenApi;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub cookies: CookiePolicy,
    pub backend_name: &'static str,
}

impl AppState {
    pub fn new(
        config: &ConsoleConfig,
        backend: Arc<dyn Backend>,
        key: &CookieKey,
        clock: SharedClock,
    ) -> Self {
        let backend_name = backend.backend_name();
        let broker = Arc::new(ConnectionBroker::new(backend, config.pool_per_role_max));
        let gate = AccessGate::new(
            Arc::new(AccessCache::new()),
            Arc::new(BrokerAccessSource::new(broker.clone())),
        );
        let sessions = Arc::new(SessionRegistry::new(
            Sealer::new(key, clock.clone()),
            config.session_policy(),
        ));
        let transactions = Arc::new(TransactionManager::new(
            gate.clone(),
            broker.clone(),
            clock,
            config.transaction_policy(),
        ));
        let coordinator = Arc::new(Coordinator::new(
            broker,
            gate,
            sessions,
            transactions,
            config.pagination_hard_cap,
        ));
        Self {
            coordinator,
            cookies: config.cookie_policy(),
            backend_name,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let trace_layer =
        TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
            let parent = observability::trace_context_from_headers(request.headers());
            let request_id = request
                .headers()
                .get(REQUEST_ID_HEADER)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default();
            let span = tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri().path(),
                version = ?request.version(),
                request_id
            );
            span.set_parent(parent);
            span
        });

    let console = Router::new()
        .route(
            "/v1/access",
            axum::routing::get(api::access::list_access),
        )
        .route(
            "/v1/access/refresh",
            axum::routing::post(api::access::refresh_access),
        )
        .route(
            "/v1/tables/:database/:schema/:table/rows",
            axum::routing::get(api::tables::read_rows),
        )
        .route("/v1/query", axum::routing::post(api::query::execute))
        .route(
            "/v1/transactions",
            axum::routing::post(api::transactions::start),
        )
        .route(
            "/v1/transactions/:transaction_id",
            axum::routing::get(api::transactions::get).delete(api::transactions::rollback),
        )
        .route(
            "/v1/transactions/:transaction_id/ops",
            axum::routing::post(api::transactions::stage),
        )
        .route(
            "/v1/transactions/:transaction_id/commit",
            axum::routing::post(api::transactions::commit),
        )
        .route(
            "/v1/transactions/:transaction_id/extend",
            axum::routing::post(api::transactions::extend),
        )
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            api::session::require_session,
        ));

    Router::new()
        .route(
            "/v1/system/health",
            axum::routing::get(api::system::system_health),
        )
        .route("/v1/auth/login", axum::routing::post(api::session::login))
        .route("/v1/auth/logout", axum::routing::post(api::session::logout))
        .merge(console)
        .merge(
            utoipa_swagger_ui::SwaggerUi::new("/docs").url("/v1/openapi.json", ApiDoc::openapi()),
        )
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::new(REQUEST_ID_HEADER))
        .layer(SetRequestIdLayer::new(REQUEST_ID_HEADER, ConsoleRequestIds))
        .with_state(state)
}

/// Periodically evict expired sessions and expire/reap transactions until
/// `shutdown` fires. Expiry is also checked lazily on every access, so the
/// interval only bounds how long dead entries linger.
pub fn spawn_reapers(
    state: &AppState,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let coordinator = state.coordinator.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let sessions = coordinator.sessions().reap_expired();
                    let transactions = coordinator.transactions().reap().await;
                    if sessions + transactions > 0 {
                        tracing::debug!(sessions, transactions, "reaper pass");
                    }
                }
            }
        }
    })
}

//! Observability wiring for the console service.
//!
//! # Purpose
//! Installs the log subscriber (optionally exporting spans over OTLP), the
//! W3C trace-context propagator used to parent request spans, and the
//! Prometheus recorder that backs the `/metrics` listener.
//!
//! # Notes
//! Every install step runs at most once per process so tests can call
//! [`init_observability`] freely. OTLP export is enabled only when
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is present.
use metrics::Unit;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::propagation::Extractor;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::OnceLock;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,sqlx=warn";

static SUBSCRIBER: OnceLock<()> = OnceLock::new();
static PROPAGATOR: OnceLock<()> = OnceLock::new();
static RECORDER: OnceLock<PrometheusHandle> = OnceLock::new();

/// Sets up logging, tracing and metrics; returns the handle the metrics
/// listener renders from.
pub fn init_observability(service: &str) -> PrometheusHandle {
    install_propagator();
    SUBSCRIBER.get_or_init(|| install_subscriber(service));
    RECORDER
        .get_or_init(|| {
            let handle = install_recorder();
            describe_console_metrics();
            handle
        })
        .clone()
}

fn install_propagator() {
    PROPAGATOR.get_or_init(|| global::set_text_map_propagator(TraceContextPropagator::new()));
}

fn install_subscriber(service: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let logs = tracing_subscriber::fmt::layer().with_target(false);
    let base = tracing_subscriber::registry().with(filter).with(logs);
    let installed = match otlp_provider(service) {
        Some(provider) => {
            let spans = tracing_opentelemetry::layer().with_tracer(provider.tracer(service.to_string()));
            global::set_tracer_provider(provider);
            base.with(spans).try_init()
        }
        None => base.try_init(),
    };
    // A test harness may already own the global subscriber.
    if installed.is_err() {
        tracing::debug!("global subscriber already set");
    }
}

fn otlp_provider(service: &str) -> Option<SdkTracerProvider> {
    std::env::var_os("OTEL_EXPORTER_OTLP_ENDPOINT")?;
    let exporter = match opentelemetry_otlp::SpanExporter::builder().with_tonic().build() {
        Ok(exporter) => exporter,
        Err(err) => {
            eprintln!("otlp exporter disabled: {err}");
            return None;
        }
    };
    let resource = Resource::builder_empty()
        .with_attributes(service_attributes(service))
        .build();
    Some(
        SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(resource)
            .build(),
    )
}

fn service_attributes(service: &str) -> Vec<KeyValue> {
    let instance = std::env::var("DBCONSOLE_INSTANCE_ID")
        .or_else(|_| std::env::var("HOSTNAME"))
        .ok();
    let environment = std::env::var("DEPLOYMENT_ENVIRONMENT").ok();
    [
        Some(("service.name", service.to_string())),
        Some(("service.version", env!("CARGO_PKG_VERSION").to_string())),
        instance.map(|value| ("service.instance.id", value)),
        environment.map(|value| ("deployment.environment", value)),
    ]
    .into_iter()
    .flatten()
    .map(|(key, value)| KeyValue::new(key, value))
    .collect()
}

/// Installs the global recorder. When one is already installed (another
/// test, an embedding process) a detached recorder is returned instead and
/// the console's metrics keep flowing to the existing one.
fn install_recorder() -> PrometheusHandle {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => handle,
        Err(err) => {
            tracing::warn!(error = %err, "metrics recorder already installed");
            PrometheusBuilder::new().build_recorder().handle()
        }
    }
}

fn describe_console_metrics() {
    metrics::describe_counter!("dbconsole_logins_total", "Login attempts by outcome.");
    metrics::describe_counter!(
        "dbconsole_access_probes_total",
        "Catalog privilege probes issued by the access gate."
    );
    metrics::describe_counter!("dbconsole_commits_total", "Transaction commits by outcome.");
    metrics::describe_counter!(
        "dbconsole_transactions_expired_total",
        "Transactions rolled back after their lease ran out."
    );
    metrics::describe_gauge!("dbconsole_sessions_active", "Live sessions in the registry.");
    metrics::describe_gauge!(
        "dbconsole_transactions_active",
        "Open or committing transactions."
    );
    metrics::describe_histogram!(
        "dbconsole_broker_acquire_seconds",
        Unit::Seconds,
        "Time spent waiting for a per-user backend connection."
    );
}

/// Parent context carried by the request's `traceparent`/`tracestate`.
pub fn trace_context_from_headers(headers: &axum::http::HeaderMap) -> opentelemetry::Context {
    install_propagator();
    global::get_text_map_propagator(|propagator| propagator.extract(&RequestHeaders(headers)))
}

struct RequestHeaders<'a>(&'a axum::http::HeaderMap);

impl Extractor for RequestHeaders<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key)?.to_str().ok()
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(axum::http::HeaderName::as_str).collect()
    }
}

pub async fn serve_metrics<F>(
    handle: PrometheusHandle,
    addr: SocketAddr,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "metrics listening");
    axum::serve(listener, metrics_router(handle))
        .with_graceful_shutdown(shutdown)
        .await
}

fn metrics_router(handle: PrometheusHandle) -> axum::Router {
    axum::Router::new().route(
        "/metrics",
        axum::routing::get(move || std::future::ready(handle.render())),
    )
}

//! Console service entry point.
//!
//! # Purpose
//! Loads configuration, picks the backend, wires state and routers, then runs
//! the HTTP server next to the metrics listener and the reapers until ctrl-c.
use anyhow::Context;
use dbconsole::app::{build_router, spawn_reapers, AppState};
use dbconsole::auth::CookieKey;
use dbconsole::backend::memory::{MemoryBackend, MemoryFixture};
use dbconsole::backend::postgres::PostgresBackend;
use dbconsole::backend::Backend;
use dbconsole::clock::{SharedClock, SystemClock};
use dbconsole::config::{BackendKind, ConsoleConfig};
use dbconsole::observability;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ConsoleConfig::from_env_or_yaml().context("console config")?;
    run_with_shutdown(config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(config: ConsoleConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("dbconsole");
    let state = build_state(&config)?;
    let stop = CancellationToken::new();
    let metrics_task = tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
        stop.clone().cancelled_owned(),
    ));
    let reapers = spawn_reapers(
        &state,
        Duration::from_millis(config.reaper_interval_ms),
        stop.clone(),
    );

    let addr = config.bind_addr;
    tracing::info!(%addr, backend = state.backend_name, "console listening");
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    let served = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await;

    stop.cancel();
    let _ = reapers.await;
    match metrics_task.await {
        Ok(Err(err)) => tracing::warn!(error = %err, "metrics listener failed"),
        Err(err) => tracing::warn!(error = %err, "metrics task panicked"),
        Ok(Ok(())) => {}
    }
    served.context("http server")
}

fn build_state(config: &ConsoleConfig) -> anyhow::Result<AppState> {
    let backend = build_backend(config)?;
    let key = match &config.cookie_key {
        Some(key) => key.clone(),
        None => {
            tracing::warn!("no cookie key configured; using a random key, cookies will not survive a restart");
            CookieKey::generate()
        }
    };
    let clock: SharedClock = Arc::new(SystemClock);
    Ok(AppState::new(config, backend, &key, clock))
}

fn build_backend(config: &ConsoleConfig) -> anyhow::Result<Arc<dyn Backend>> {
    match config.backend {
        BackendKind::Memory => {
            let fixture = match &config.memory_fixture {
                Some(path) => {
                    let text = std::fs::read_to_string(path)
                        .with_context(|| format!("read memory fixture {}", path.display()))?;
                    MemoryFixture::from_yaml(&text).with_context(|| "parse memory fixture")?
                }
                None => {
                    tracing::warn!("memory backend started without a fixture; no role can log in");
                    MemoryFixture::default()
                }
            };
            Ok(Arc::new(MemoryBackend::from_fixture(
                fixture,
                config.postgres.default_database.clone(),
            )))
        }
        BackendKind::Postgres => Ok(Arc::new(PostgresBackend::new(config.postgres_settings()))),
    }
}

//! Process-wide access cache.
//!
//! # Purpose
//! Holds one [`RoleAccess`] per role so navigation does not re-run catalog
//! discovery on every request. Entries are replaced wholesale; there is no
//! per-table invalidation.
//!
//! # Concurrency
//! Reads take the shared guard; replacement takes the exclusive guard. The
//! probe itself always runs with no guard held.
use crate::access::probe;
use crate::access::RoleAccess;
use crate::backend::Credentials;
use crate::broker::ConnectionBroker;
use crate::error::{ConsoleError, ConsoleResult, ErrorKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Produces a fresh [`RoleAccess`] for a role.
#[async_trait]
pub trait AccessSource: Send + Sync {
    async fn load(
        &self,
        credentials: &Credentials,
        cancel: &CancellationToken,
    ) -> ConsoleResult<RoleAccess>;
}

#[derive(Default)]
pub struct AccessCache {
    entries: RwLock<HashMap<String, Arc<RoleAccess>>>,
}

impl AccessCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, role: &str) -> Option<Arc<RoleAccess>> {
        self.entries.read().await.get(role).cloned()
    }

    /// Swap in a new view for `access.role`, returning the stored handle.
    pub async fn replace(&self, access: RoleAccess) -> Arc<RoleAccess> {
        let access = Arc::new(access);
        self.entries
            .write()
            .await
            .insert(access.role.clone(), access.clone());
        access
    }

    pub async fn invalidate(&self, role: &str) {
        self.entries.write().await.remove(role);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Cached view, or probe through `source` and populate on a miss.
    ///
    /// Two concurrent misses for the same role may both probe; the later
    /// result wins, which is harmless because both describe the same grants.
    pub async fn get_or_load(
        &self,
        credentials: &Credentials,
        source: &dyn AccessSource,
        cancel: &CancellationToken,
    ) -> ConsoleResult<Arc<RoleAccess>> {
        if let Some(hit) = self.get(&credentials.role).await {
            return Ok(hit);
        }
        self.reload(credentials, source, cancel).await
    }

    /// Discard the cached view for the role and probe again. When the probe
    /// fails the role is left uncached, so no decision is made from the
    /// discarded view.
    pub async fn reload(
        &self,
        credentials: &Credentials,
        source: &dyn AccessSource,
        cancel: &CancellationToken,
    ) -> ConsoleResult<Arc<RoleAccess>> {
        self.invalidate(&credentials.role).await;
        match source.load(credentials, cancel).await {
            Ok(access) => {
                metrics::counter!("dbconsole_access_probes_total", "outcome" => "ok").increment(1);
                tracing::debug!(
                    role = %credentials.role,
                    databases = access.databases.len(),
                    "access view loaded"
                );
                Ok(self.replace(access).await)
            }
            Err(err) => {
                metrics::counter!("dbconsole_access_probes_total", "outcome" => "error")
                    .increment(1);
                Err(err)
            }
        }
    }
}

/// [`AccessSource`] that probes every connectable database through the
/// connection broker, as the role itself.
pub struct BrokerAccessSource {
    broker: Arc<ConnectionBroker>,
}

impl BrokerAccessSource {
    pub fn new(broker: Arc<ConnectionBroker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl AccessSource for BrokerAccessSource {
    async fn load(
        &self,
        credentials: &Credentials,
        cancel: &CancellationToken,
    ) -> ConsoleResult<RoleAccess> {
        let databases = self
            .broker
            .with_connection(credentials, None, cancel, |conn| {
                Box::pin(async move { Ok(probe::list_databases(conn).await?) })
            })
            .await?;

        let mut access = RoleAccess::empty(credentials.role.clone());
        for database in databases {
            let role = credentials.role.clone();
            let probed = self
                .broker
                .with_connection(credentials, Some(&database), cancel, move |conn| {
                    Box::pin(async move { Ok(probe::probe_database(conn, &role).await?) })
                })
                .await;
            match probed {
                Ok(view) if !view.is_empty() => {
                    access.databases.insert(database, view);
                }
                Ok(_) => {}
                // A database listed as connectable may still refuse this role
                // (pg_hba rules); it is simply not part of the view.
                Err(err) if matches!(err.kind, ErrorKind::Auth | ErrorKind::BackendDenied) => {
                    tracing::debug!(
                        role = %credentials.role,
                        database = %database,
                        error = %err,
                        "database skipped during probe"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(access)
    }
}

/// Fixed answers, for tests and for wiring a cache without a broker.
#[derive(Default)]
pub struct StaticAccessSource {
    views: std::sync::Mutex<HashMap<String, RoleAccess>>,
}

impl StaticAccessSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, access: RoleAccess) {
        if let Ok(mut views) = self.views.lock() {
            views.insert(access.role.clone(), access);
        }
    }
}

#[async_trait]
impl AccessSource for StaticAccessSource {
    async fn load(
        &self,
        credentials: &Credentials,
        _cancel: &CancellationToken,
    ) -> ConsoleResult<RoleAccess> {
        let views = self
            .views
            .lock()
            .map_err(|_| ConsoleError::internal("static access source poisoned"))?;
        Ok(views
            .get(&credentials.role)
            .cloned()
            .unwrap_or_else(|| RoleAccess::empty(credentials.role.clone())))
    }
}

//! Connection broker.
//!
//! # Purpose
//! Scopes one backend connection, authenticated as the requesting role, to one
//! unit of work. Callers hand [`ConnectionBroker::with_connection`] a closure;
//! the broker opens, runs, and always gives the connection back.
//!
//! # Key invariants
//! - A connection opened for role `r` is never handed to work for any other
//!   role; a mismatch is discarded and reported as an internal error.
//! - Concurrency per role is bounded by a semaphore of `per_role_max` permits,
//!   independent of how the backend pools.
//! - On cancellation the in-flight connection is discarded, never reused.
//!
//! # Concurrency model
//! Permit acquisition, open, and the work itself all race the caller's
//! [`CancellationToken`].
use crate::backend::{Backend, Connection, Credentials};
use crate::error::{ConsoleError, ConsoleResult};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub struct ConnectionBroker {
    backend: Arc<dyn Backend>,
    per_role_max: usize,
    permits: DashMap<String, Arc<Semaphore>>,
}

impl ConnectionBroker {
    pub fn new(backend: Arc<dyn Backend>, per_role_max: usize) -> Self {
        Self {
            backend,
            per_role_max: per_role_max.max(1),
            permits: DashMap::new(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn per_role_max(&self) -> usize {
        self.per_role_max
    }

    /// Run `work` on a connection authenticated as `credentials.role`.
    ///
    /// `database = None` targets the backend's default database. The
    /// connection is released when `work` finishes, successfully or not, and
    /// discarded if the token fires first.
    pub async fn with_connection<T, F>(
        &self,
        credentials: &Credentials,
        database: Option<&str>,
        cancel: &CancellationToken,
        work: F,
    ) -> ConsoleResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut dyn Connection) -> BoxFuture<'c, ConsoleResult<T>> + Send,
    {
        if cancel.is_cancelled() {
            return Err(ConsoleError::canceled());
        }
        let semaphore = self
            .permits
            .entry(credentials.role.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_role_max)))
            .clone();

        let started = Instant::now();
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ConsoleError::canceled()),
            permit = semaphore.acquire_owned() => permit
                .map_err(|_| ConsoleError::internal("role permit pool closed"))?,
        };
        let mut conn = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ConsoleError::canceled()),
            opened = self.backend.open(credentials, database) => opened?,
        };
        metrics::histogram!("dbconsole_broker_acquire_seconds")
            .record(started.elapsed().as_secs_f64());

        if conn.role() != credentials.role {
            conn.discard();
            return Err(ConsoleError::internal(format!(
                "backend returned a connection for role {:?} when {:?} was requested",
                conn.role(),
                credentials.role
            )));
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = work(conn.as_mut()) => Some(result),
        };
        match outcome {
            Some(result) => {
                conn.release();
                result
            }
            None => {
                tracing::debug!(role = %credentials.role, "work canceled, discarding connection");
                conn.discard();
                Err(ConsoleError::canceled())
            }
        }
    }
}

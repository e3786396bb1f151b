//! RBAC gate.
//!
//! # Purpose
//! Stateless predicates over the [`AccessCache`]: "may this role do this to
//! that object?". A cache miss triggers a probe as the role. The gate is
//! consulted before anything is staged or executed; the backend remains the
//! final authority when the statement actually runs.
//!
//! # Notes
//! A backend refusal of a gate-approved statement does not touch the cache.
//! Only an explicit refresh replaces a role's view.
use crate::access::cache::{AccessCache, AccessSource};
use crate::access::{Operation, RoleAccess, TableAccess, TableRef};
use crate::backend::Credentials;
use crate::error::{ConsoleError, ConsoleResult};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AccessGate {
    cache: Arc<AccessCache>,
    source: Arc<dyn AccessSource>,
}

impl AccessGate {
    pub fn new(cache: Arc<AccessCache>, source: Arc<dyn AccessSource>) -> Self {
        Self { cache, source }
    }

    pub fn cache(&self) -> &Arc<AccessCache> {
        &self.cache
    }

    /// The role's current view, probing on a miss.
    pub async fn view(
        &self,
        credentials: &Credentials,
        cancel: &CancellationToken,
    ) -> ConsoleResult<Arc<RoleAccess>> {
        self.cache
            .get_or_load(credentials, self.source.as_ref(), cancel)
            .await
    }

    /// Throw the role's view away and probe again.
    pub async fn refresh(
        &self,
        credentials: &Credentials,
        cancel: &CancellationToken,
    ) -> ConsoleResult<Arc<RoleAccess>> {
        self.cache
            .reload(credentials, self.source.as_ref(), cancel)
            .await
    }

    pub async fn may_do(
        &self,
        credentials: &Credentials,
        op: Operation,
        target: &TableRef,
        cancel: &CancellationToken,
    ) -> ConsoleResult<bool> {
        Ok(self.view(credentials, cancel).await?.permits(op, target))
    }

    /// Like [`AccessGate::may_do`] but turns a "no" into `gate_denied`.
    pub async fn check(
        &self,
        credentials: &Credentials,
        op: Operation,
        target: &TableRef,
        cancel: &CancellationToken,
    ) -> ConsoleResult<()> {
        if self.may_do(credentials, op, target, cancel).await? {
            Ok(())
        } else {
            Err(denied(op, target))
        }
    }

    /// Table metadata for a target the role may perform `op` on.
    pub async fn table_for(
        &self,
        credentials: &Credentials,
        op: Operation,
        target: &TableRef,
        cancel: &CancellationToken,
    ) -> ConsoleResult<TableAccess> {
        let view = self.view(credentials, cancel).await?;
        match view.table(target) {
            Some(table) if table.privileges.allows(op) => Ok(table.clone()),
            _ => Err(denied(op, target)),
        }
    }

    pub async fn check_database_access(
        &self,
        credentials: &Credentials,
        database: &str,
        cancel: &CancellationToken,
    ) -> ConsoleResult<bool> {
        Ok(self.view(credentials, cancel).await?.has_database(database))
    }

    pub async fn check_schema_access(
        &self,
        credentials: &Credentials,
        database: &str,
        schema: &str,
        cancel: &CancellationToken,
    ) -> ConsoleResult<bool> {
        Ok(self
            .view(credentials, cancel)
            .await?
            .has_schema(database, schema))
    }

    pub async fn check_table_access(
        &self,
        credentials: &Credentials,
        target: &TableRef,
        cancel: &CancellationToken,
    ) -> ConsoleResult<bool> {
        Ok(self.view(credentials, cancel).await?.table(target).is_some())
    }
}

fn denied(op: Operation, target: &TableRef) -> ConsoleError {
    ConsoleError::gate_denied(format!("{op} on {target} is not permitted for this role"))
}

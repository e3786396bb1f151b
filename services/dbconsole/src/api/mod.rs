//! Console HTTP API module.
//!
//! # Purpose
//! Exposes the route handler modules plus the request plumbing they share:
//! the request id, the authenticated-session extractor, and [`run`], which
//! executes coordinator work on its own task so a disconnecting client cancels
//! it through a token instead of dropping it mid-statement.
pub mod access;
pub mod error;
pub mod openapi;
pub mod query;
pub mod session;
pub mod system;
pub mod tables;
pub mod transactions;
pub mod types;

use crate::api::error::{api_internal_message, ApiError};
use crate::app::AppState;
use crate::auth::ActiveSession;
use crate::clock::new_id;
use crate::coordinator::Coordinator;
use crate::error::ConsoleResult;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request};
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::request_id::{MakeRequestId, RequestId as TowerRequestId};

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Mints request ids for `SetRequestIdLayer`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleRequestIds;

impl MakeRequestId for ConsoleRequestIds {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<TowerRequestId> {
        HeaderValue::from_str(&new_id()).ok().map(TowerRequestId::new)
    }
}

/// The `x-request-id` of the current request, if any.
#[derive(Debug, Clone, Default)]
pub struct RequestId(pub Option<String>);

impl RequestId {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self(
            headers
                .get(REQUEST_ID_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string),
        )
    }

    pub fn as_deref(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for RequestId {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_headers(&parts.headers))
    }
}

/// A request that passed [`session::require_session`].
#[derive(Debug, Clone)]
pub struct Authenticated {
    pub request_id: RequestId,
    pub active: ActiveSession,
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let request_id = RequestId::from_headers(&parts.headers);
        let Some(active) = parts.extensions.get::<ActiveSession>().cloned() else {
            tracing::error!("handler mounted without the session layer");
            return Err(api_internal_message(
                "session layer missing",
                request_id.as_deref(),
            ));
        };
        Ok(Self { request_id, active })
    }
}

/// Run coordinator work on a separate task tied to a cancellation token.
///
/// If the handler future is dropped (client gone), the token fires and the
/// task winds down through the broker's cancel path.
pub(crate) async fn run<T, F, Fut>(
    state: &AppState,
    request_id: &RequestId,
    work: F,
) -> Result<T, ApiError>
where
    F: FnOnce(Arc<Coordinator>, CancellationToken) -> Fut,
    Fut: Future<Output = ConsoleResult<T>> + Send + 'static,
    T: Send + 'static,
{
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();
    let task = tokio::spawn(work(state.coordinator.clone(), cancel));
    match task.await {
        Ok(result) => result.map_err(|err| ApiError::from_console(err, request_id.as_deref())),
        Err(err) => {
            tracing::error!(error = %err, "request task failed");
            Err(api_internal_message(
                "request processing failed",
                request_id.as_deref(),
            ))
        }
    }
}

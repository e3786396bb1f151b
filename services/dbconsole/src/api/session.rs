//! Login, logout and the session layer.
//!
//! # Purpose
//! `login` and `logout` own the two console cookies. Every other console
//! route sits behind [`require_session`], which resolves the cookies through
//! the coordinator, attaches the [`crate::auth::ActiveSession`] to the request
//! and, after a silent re-login, sends the fresh session cookie.
//!
//! # Security considerations
//! - Any `auth`-family failure clears both cookies in the same response.
//! - The login body is never logged.
use crate::api::error::ApiError;
use crate::api::types::{ErrorResponse, LoginRequest, LoginResponse};
use crate::api::{run, RequestId};
use crate::app::AppState;
use crate::auth::PresentedCookies;
use axum::extract::{Request, State};
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cookie::Cookie;

#[utoipa::path(
    post,
    path = "/v1/auth/login",
    tag = "auth",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Logged in; session and identity cookies set", body = LoginResponse),
        (status = 400, description = "Missing username or password", body = ErrorResponse),
        (status = 401, description = "Wrong credentials or nothing accessible", body = ErrorResponse),
        (status = 502, description = "Database unreachable", body = ErrorResponse)
    )
)]
pub(crate) async fn login(
    State(state): State<AppState>,
    request_id: RequestId,
    Json(body): Json<LoginRequest>,
) -> Result<Response, ApiError> {
    let outcome = run(&state, &request_id, move |coordinator, cancel| async move {
        coordinator
            .login(&body.username, &body.password, &cancel)
            .await
    })
    .await?;
    let mut response = Json(LoginResponse {
        username: outcome.session.username.clone(),
        access: outcome.access.as_ref().clone(),
    })
    .into_response();
    let headers = response.headers_mut();
    append_cookie(headers, state.cookies.session(outcome.session.session_cookie));
    append_cookie(headers, state.cookies.identity(outcome.session.identity_cookie));
    Ok(response)
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    tag = "auth",
    responses(
        (status = 204, description = "Session ended and cookies cleared")
    )
)]
pub(crate) async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let presented = PresentedCookies::from_headers(&headers);
    state.coordinator.logout(&presented).await;
    let mut response = StatusCode::NO_CONTENT.into_response();
    clear_cookies(&state, response.headers_mut());
    response
}

/// Authenticate the request from its cookies.
pub(crate) async fn require_session(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let request_id = RequestId::from_headers(request.headers());
    let presented = PresentedCookies::from_headers(request.headers());
    let resolved = run(&state, &request_id, move |coordinator, cancel| async move {
        coordinator.resolve(&presented, &cancel).await
    })
    .await;
    match resolved {
        Ok(resolved) => {
            request.extensions_mut().insert(resolved.active);
            let mut response = next.run(request).await;
            if let Some(issued) = resolved.reissued {
                append_cookie(
                    response.headers_mut(),
                    state.cookies.session(issued.session_cookie),
                );
            }
            response
        }
        Err(err) => {
            let clear = err.is_auth();
            let mut response = err.into_response();
            if clear {
                clear_cookies(&state, response.headers_mut());
            }
            response
        }
    }
}

fn clear_cookies(state: &AppState, headers: &mut HeaderMap) {
    for cookie in state.cookies.clear_all() {
        append_cookie(headers, cookie);
    }
}

fn append_cookie(headers: &mut HeaderMap, cookie: Cookie<'static>) {
    match HeaderValue::from_str(&cookie.to_string()) {
        Ok(value) => {
            headers.append(SET_COOKIE, value);
        }
        Err(err) => tracing::error!(error = %err, name = cookie.name(), "cookie is not a valid header"),
    }
}

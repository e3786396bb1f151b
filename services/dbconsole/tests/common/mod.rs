#![allow(dead_code)]

use axum::body::Body;
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use dbconsole::access::{Privileges, TableRef};
use dbconsole::app::{build_router, AppState};
use dbconsole::auth::CookieKey;
use dbconsole::backend::memory::{ColumnDef, MemoryBackend, TableDef};
use dbconsole::clock::{ManualClock, SharedClock};
use dbconsole::config::ConsoleConfig;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

pub const DATABASE: &str = "testdb";

pub fn users() -> TableRef {
    TableRef::new(DATABASE, "public", "users")
}

pub struct TestConsole {
    pub app: Router,
    pub state: AppState,
    pub backend: Arc<MemoryBackend>,
    pub clock: Arc<ManualClock>,
}

/// Roles:
/// - `alice` / `p1`: SELECT on `testdb.public.users`
/// - `editor` / `p4`: every privilege on `testdb.public.users`
/// - `noone` / `p`: no grants at all
///
/// `users(id integer primary key, name text)` holds `user_rows` rows with ids
/// starting at 1; row 7 is named `old`.
pub async fn console(user_rows: usize, hard_cap: u64) -> TestConsole {
    let backend = Arc::new(MemoryBackend::new(DATABASE));
    backend.add_role("alice", "p1").await;
    backend.add_role("editor", "p4").await;
    backend.add_role("noone", "p").await;
    backend
        .create_table(
            &users(),
            TableDef {
                columns: vec![
                    ColumnDef::new("id", "integer", false),
                    ColumnDef::new("name", "text", true),
                ],
                primary_key: vec!["id".to_string()],
                ..TableDef::default()
            },
        )
        .await;
    backend
        .grant(&users(), "alice", Privileges::read_only())
        .await
        .expect("grant alice");
    backend
        .grant(&users(), "editor", Privileges::all())
        .await
        .expect("grant editor");
    let rows = (1..=user_rows)
        .map(|id| {
            let name = if id == 7 {
                "old".to_string()
            } else {
                format!("user{id}")
            };
            vec![json!(id), json!(name)]
        })
        .collect();
    backend.insert_rows(&users(), rows).await.expect("rows");

    let config = ConsoleConfig {
        pagination_hard_cap: hard_cap,
        transaction_lease_ms: 60_000,
        cookie_secure: false,
        ..ConsoleConfig::default()
    };
    let clock = Arc::new(ManualClock::new());
    let shared: SharedClock = clock.clone();
    let state = AppState::new(&config, backend.clone(), &CookieKey::generate(), shared);
    TestConsole {
        app: build_router(state.clone()),
        state,
        backend,
        clock,
    }
}

pub async fn read_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

pub fn json_request(method: &str, uri: &str, cookies: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .header(COOKIE, cookies)
        .body(Body::from(body.to_string()))
        .expect("request")
}

pub fn empty_request(method: &str, uri: &str, cookies: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(COOKIE, cookies)
        .body(Body::empty())
        .expect("request")
}

/// `name=value` pairs from every `Set-Cookie` header, including removals
/// (empty value).
pub fn set_cookies(response: &Response) -> Vec<(String, String)> {
    response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|text| cookie::Cookie::parse(text.to_string()).ok())
        .map(|cookie| (cookie.name().to_string(), cookie.value().to_string()))
        .collect()
}

/// A `Cookie` header value carrying the given pairs.
pub fn cookie_header(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Log in and return the status, the cookie header to send next, and the body.
pub async fn login(app: &Router, username: &str, password: &str) -> (StatusCode, String, Value) {
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/auth/login",
            "",
            json!({"username": username, "password": password}),
        ))
        .await
        .expect("login");
    let status = response.status();
    let cookies = cookie_header(&set_cookies(&response));
    (status, cookies, read_json(response).await)
}

pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json")
    };
    (status, body)
}

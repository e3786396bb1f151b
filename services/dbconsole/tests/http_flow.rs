mod common;

use axum::http::StatusCode;
use common::{
    console, cookie_header, empty_request, json_request, login, read_json, send, set_cookies,
    users,
};
use serde_json::json;
use std::time::Duration;
use tower::ServiceExt;

const USERS_ROWS: &str = "/v1/tables/testdb/public/users/rows";

fn name_of(rows: &[Vec<serde_json::Value>], id: i64) -> Option<serde_json::Value> {
    rows.iter()
        .find(|row| row[0] == json!(id))
        .map(|row| row[1].clone())
}

/// Replace one character in the middle of a base64url value with a
/// different base64url character.
fn flip_middle(value: &str) -> String {
    let mut chars: Vec<char> = value.chars().collect();
    let middle = chars.len() / 2;
    chars[middle] = if chars[middle] == 'A' { 'B' } else { 'A' };
    chars.into_iter().collect()
}

#[tokio::test]
async fn health_reports_backend_and_counts() {
    let console = console(0, 1000).await;
    let (status, body) = send(&console.app, empty_request("GET", "/v1/system/health", "")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["backend"], "memory");
    assert_eq!(body["sessions"], 0);
    assert_eq!(body["transactions"], 0);
}

#[tokio::test]
async fn login_sets_cookies_and_lists_select_only_access() {
    let console = console(10, 1000).await;
    let response = console
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/auth/login",
            "",
            json!({"username": "alice", "password": "p1"}),
        ))
        .await
        .expect("login");
    assert_eq!(response.status(), StatusCode::OK);
    let raw: Vec<String> = response
        .headers()
        .get_all(axum::http::header::SET_COOKIE)
        .iter()
        .map(|value| value.to_str().expect("ascii").to_string())
        .collect();
    assert_eq!(raw.len(), 2);
    for cookie in &raw {
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Strict"));
    }
    let cookies = cookie_header(&set_cookies(&response));
    assert!(cookies.contains("dbconsole_session="));
    assert!(cookies.contains("dbconsole_identity="));
    let body = read_json(response).await;
    assert_eq!(body["username"], "alice");
    assert!(body.to_string().find("p1").is_none());

    let (status, body) = send(&console.app, empty_request("GET", "/v1/access", &cookies)).await;
    assert_eq!(status, StatusCode::OK);
    let databases = body["access"]["databases"].as_object().expect("databases");
    assert_eq!(databases.keys().collect::<Vec<_>>(), vec!["testdb"]);
    let tables = body["access"]["databases"]["testdb"]["schemas"]["public"]["tables"]
        .as_object()
        .expect("tables");
    assert_eq!(tables.keys().collect::<Vec<_>>(), vec!["users"]);
    assert_eq!(
        tables["users"]["privileges"],
        json!({"S": true, "I": false, "U": false, "D": false})
    );
}

#[tokio::test]
async fn login_without_grants_is_no_resources_and_sets_nothing() {
    let console = console(1, 1000).await;
    let response = console
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/auth/login",
            "",
            json!({"username": "noone", "password": "p"}),
        ))
        .await
        .expect("login");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(set_cookies(&response).is_empty());
    let body = read_json(response).await;
    assert_eq!(body["code"], "no_resources");
    assert!(body["request_id"].is_string());
    assert_eq!(console.state.coordinator.sessions().len(), 0);
}

#[tokio::test]
async fn wrong_password_is_auth() {
    let console = console(1, 1000).await;
    let (status, cookies, body) = login(&console.app, "alice", "nope").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(cookies.is_empty());
    assert_eq!(body["code"], "auth");
}

#[tokio::test]
async fn console_routes_require_a_session() {
    let console = console(1, 1000).await;
    let (status, body) = send(&console.app, empty_request("GET", "/v1/access", "")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "auth");
}

#[tokio::test]
async fn staged_cell_edit_commits_to_the_backend() {
    let console = console(10, 1000).await;
    let (status, cookies, _) = login(&console.app, "editor", "p4").await;
    assert_eq!(status, StatusCode::OK);

    let (status, started) = send(
        &console.app,
        json_request(
            "POST",
            "/v1/transactions",
            &cookies,
            json!({"database": "testdb", "schema": "public", "table": "users"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(started["state"], "active");
    let id = started["id"].as_str().expect("id").to_string();

    let (status, staged) = send(
        &console.app,
        json_request(
            "POST",
            &format!("/v1/transactions/{id}/ops"),
            &cookies,
            json!({
                "kind": "update_cell",
                "row": {"id": 7},
                "column": "name",
                "old_value": "old",
                "new_value": "new"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(staged["seq"], 1);
    assert_eq!(staged["row"], json!({"id": 7}));

    // Nothing reaches the table before commit.
    let rows = console.backend.rows(&users()).await.expect("rows");
    assert_eq!(name_of(&rows, 7), Some(json!("old")));

    let (status, committed) = send(
        &console.app,
        empty_request("POST", &format!("/v1/transactions/{id}/commit"), &cookies),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(committed["state"], "committed");
    let rows = console.backend.rows(&users()).await.expect("rows");
    assert_eq!(name_of(&rows, 7), Some(json!("new")));
}

#[tokio::test]
async fn commit_against_a_deleted_row_is_stale_and_keeps_staging() {
    let console = console(10, 1000).await;
    let (_, cookies, _) = login(&console.app, "editor", "p4").await;
    let (_, started) = send(
        &console.app,
        json_request(
            "POST",
            "/v1/transactions",
            &cookies,
            json!({"database": "testdb", "schema": "public", "table": "users"}),
        ),
    )
    .await;
    let id = started["id"].as_str().expect("id").to_string();
    let (status, _) = send(
        &console.app,
        json_request(
            "POST",
            &format!("/v1/transactions/{id}/ops"),
            &cookies,
            json!({
                "kind": "update_cell",
                "row": {"id": 7},
                "column": "name",
                "old_value": "old",
                "new_value": "new"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let deleted = console
        .backend
        .delete_where(&users(), "id", &json!(7))
        .await
        .expect("delete");
    assert_eq!(deleted, 1);

    let (status, body) = send(
        &console.app,
        empty_request("POST", &format!("/v1/transactions/{id}/commit"), &cookies),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "stale_row");

    let (status, view) = send(
        &console.app,
        empty_request("GET", &format!("/v1/transactions/{id}"), &cookies),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["state"], "active");
    assert_eq!(view["ops"].as_array().expect("ops").len(), 1);
    assert_eq!(view["last_error"]["code"], "stale_row");
    assert_eq!(view["last_error"]["op_seq"], 1);
    let rows = console.backend.rows(&users()).await.expect("rows");
    assert_eq!(rows.len(), 9);
}

#[tokio::test]
async fn staging_after_the_lease_is_expired_and_rollback_is_a_no_op() {
    let console = console(10, 1000).await;
    let (_, cookies, _) = login(&console.app, "editor", "p4").await;
    let (_, started) = send(
        &console.app,
        json_request(
            "POST",
            "/v1/transactions",
            &cookies,
            json!({"database": "testdb", "schema": "public", "table": "users"}),
        ),
    )
    .await;
    let id = started["id"].as_str().expect("id").to_string();

    console.clock.advance(Duration::from_secs(120));
    let (status, body) = send(
        &console.app,
        json_request(
            "POST",
            &format!("/v1/transactions/{id}/ops"),
            &cookies,
            json!({"kind": "delete_row", "row": {"id": 1}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "expired");

    let (status, view) = send(
        &console.app,
        empty_request("GET", &format!("/v1/transactions/{id}"), &cookies),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["state"], "expired");
    assert_eq!(view["ops"].as_array().expect("ops").len(), 0);

    let (status, view) = send(
        &console.app,
        empty_request("DELETE", &format!("/v1/transactions/{id}"), &cookies),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["state"], "expired");
    assert_eq!(console.backend.rows(&users()).await.expect("rows").len(), 10);
}

#[tokio::test]
async fn extend_pushes_the_deadline() {
    let console = console(10, 1000).await;
    let (_, cookies, _) = login(&console.app, "editor", "p4").await;
    let (_, started) = send(
        &console.app,
        json_request(
            "POST",
            "/v1/transactions",
            &cookies,
            json!({"database": "testdb", "schema": "public", "table": "users"}),
        ),
    )
    .await;
    let id = started["id"].as_str().expect("id").to_string();

    console.clock.advance(Duration::from_secs(45));
    let (status, view) = send(
        &console.app,
        empty_request("POST", &format!("/v1/transactions/{id}/extend"), &cookies),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["expires_in_ms"], 60_000);

    console.clock.advance(Duration::from_secs(45));
    let (status, _) = send(
        &console.app,
        empty_request("POST", &format!("/v1/transactions/{id}/commit"), &cookies),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn second_transaction_for_the_same_user_conflicts() {
    let console = console(1, 1000).await;
    let (_, cookies, _) = login(&console.app, "editor", "p4").await;
    let start = || {
        json_request(
            "POST",
            "/v1/transactions",
            &cookies,
            json!({"database": "testdb", "schema": "public", "table": "users"}),
        )
    };
    let (status, _) = send(&console.app, start()).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, body) = send(&console.app, start()).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "conflict");
}

#[tokio::test]
async fn select_only_role_cannot_stage_updates() {
    let console = console(10, 1000).await;
    let (_, cookies, _) = login(&console.app, "alice", "p1").await;
    let (status, started) = send(
        &console.app,
        json_request(
            "POST",
            "/v1/transactions",
            &cookies,
            json!({"database": "testdb", "schema": "public", "table": "users"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = started["id"].as_str().expect("id").to_string();
    let (status, body) = send(
        &console.app,
        json_request(
            "POST",
            &format!("/v1/transactions/{id}/ops"),
            &cookies,
            json!({"kind": "update_cell", "row": {"id": 7}, "column": "name", "new_value": "x"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "gate_denied");
}

#[tokio::test]
async fn revoked_grant_after_refresh_fails_commit_at_the_gate() {
    let console = console(10, 1000).await;
    let (_, cookies, _) = login(&console.app, "editor", "p4").await;
    let (_, started) = send(
        &console.app,
        json_request(
            "POST",
            "/v1/transactions",
            &cookies,
            json!({"database": "testdb", "schema": "public", "table": "users"}),
        ),
    )
    .await;
    let id = started["id"].as_str().expect("id").to_string();
    let (status, _) = send(
        &console.app,
        json_request(
            "POST",
            &format!("/v1/transactions/{id}/ops"),
            &cookies,
            json!({"kind": "delete_row", "row": {"id": 3}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    console
        .backend
        .grant(&users(), "editor", dbconsole::access::Privileges::read_only())
        .await
        .expect("downgrade");
    let (status, body) = send(
        &console.app,
        empty_request("POST", "/v1/access/refresh", &cookies),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["access"]["databases"]["testdb"]["schemas"]["public"]["tables"]["users"]
            ["privileges"]["D"],
        false
    );

    let (status, body) = send(
        &console.app,
        empty_request("POST", &format!("/v1/transactions/{id}/commit"), &cookies),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "gate_denied");
    assert_eq!(console.backend.rows(&users()).await.expect("rows").len(), 10);
}

#[tokio::test]
async fn revoked_grant_without_refresh_is_refused_by_the_backend() {
    let console = console(10, 1000).await;
    let (_, cookies, _) = login(&console.app, "editor", "p4").await;
    let (_, started) = send(
        &console.app,
        json_request(
            "POST",
            "/v1/transactions",
            &cookies,
            json!({"database": "testdb", "schema": "public", "table": "users"}),
        ),
    )
    .await;
    let id = started["id"].as_str().expect("id").to_string();
    send(
        &console.app,
        json_request(
            "POST",
            &format!("/v1/transactions/{id}/ops"),
            &cookies,
            json!({"kind": "delete_row", "row": {"id": 3}}),
        ),
    )
    .await;
    console
        .backend
        .grant(&users(), "editor", dbconsole::access::Privileges::read_only())
        .await
        .expect("downgrade");

    let (status, body) = send(
        &console.app,
        empty_request("POST", &format!("/v1/transactions/{id}/commit"), &cookies),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "backend_denied");
    assert_eq!(console.backend.rows(&users()).await.expect("rows").len(), 10);
}

#[tokio::test]
async fn tampered_session_cookie_clears_both_cookies() {
    let console = console(1, 1000).await;
    let response = console
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/auth/login",
            "",
            json!({"username": "alice", "password": "p1"}),
        ))
        .await
        .expect("login");
    let pairs = set_cookies(&response);
    let tampered: Vec<(String, String)> = pairs
        .into_iter()
        .map(|(name, value)| {
            if name == "dbconsole_session" {
                let flipped = flip_middle(&value);
                (name, flipped)
            } else {
                (name, value)
            }
        })
        .collect();

    let response = console
        .app
        .clone()
        .oneshot(empty_request("GET", "/v1/access", &cookie_header(&tampered)))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let cleared = set_cookies(&response);
    assert!(cleared
        .iter()
        .any(|(name, value)| name == "dbconsole_session" && value.is_empty()));
    assert!(cleared
        .iter()
        .any(|(name, value)| name == "dbconsole_identity" && value.is_empty()));
    let body = read_json(response).await;
    assert_eq!(body["code"], "auth");
}

#[tokio::test]
async fn tampered_identity_cookie_next_to_a_live_session_clears_both_cookies() {
    let console = console(1, 1000).await;
    let response = console
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/auth/login",
            "",
            json!({"username": "alice", "password": "p1"}),
        ))
        .await
        .expect("login");
    let tampered: Vec<(String, String)> = set_cookies(&response)
        .into_iter()
        .map(|(name, value)| match name.as_str() {
            "dbconsole_identity" => {
                let flipped = flip_middle(&value);
                (name, flipped)
            }
            _ => (name, value),
        })
        .collect();

    let response = console
        .app
        .clone()
        .oneshot(empty_request("GET", "/v1/access", &cookie_header(&tampered)))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let cleared = set_cookies(&response);
    for cookie in ["dbconsole_session", "dbconsole_identity"] {
        assert!(cleared
            .iter()
            .any(|(name, value)| name == cookie && value.is_empty()));
    }
    let body = read_json(response).await;
    assert_eq!(body["code"], "auth");
}

#[tokio::test]
async fn idle_session_is_silently_reestablished_from_the_identity_cookie() {
    let console = console(1, 1000).await;
    let (_, cookies, _) = login(&console.app, "alice", "p1").await;
    let before = console.state.coordinator.sessions().len();

    console.clock.advance(Duration::from_secs(31 * 60));
    let response = console
        .app
        .clone()
        .oneshot(empty_request("GET", "/v1/access", &cookies))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let reissued = set_cookies(&response);
    assert_eq!(reissued.len(), 1);
    assert_eq!(reissued[0].0, "dbconsole_session");
    assert!(!reissued[0].1.is_empty());
    assert_eq!(console.state.coordinator.sessions().len(), before);
}

#[tokio::test]
async fn logout_is_idempotent_and_ends_the_session() {
    let console = console(10, 1000).await;
    let (_, cookies, _) = login(&console.app, "editor", "p4").await;
    let (_, started) = send(
        &console.app,
        json_request(
            "POST",
            "/v1/transactions",
            &cookies,
            json!({"database": "testdb", "schema": "public", "table": "users"}),
        ),
    )
    .await;
    let id = started["id"].as_str().expect("id").to_string();

    for _ in 0..2 {
        let response = console
            .app
            .clone()
            .oneshot(empty_request("POST", "/v1/auth/logout", &cookies))
            .await
            .expect("logout");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(set_cookies(&response).len(), 2);
    }
    assert_eq!(console.state.coordinator.sessions().len(), 0);

    // Replaying the cookies the browser held before logout must not log the
    // user back in through the identity cookie.
    let identity_only = cookies
        .split("; ")
        .filter(|pair| pair.starts_with("dbconsole_identity="))
        .collect::<Vec<_>>()
        .join("; ");
    for replay in [cookies.as_str(), identity_only.as_str()] {
        let (status, body) = send(&console.app, empty_request("GET", "/v1/access", replay)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "auth");
    }
    assert_eq!(console.state.coordinator.sessions().len(), 0);

    // The abandoned transaction is rolled back; a fresh login can start anew.
    let (_, cookies, _) = login(&console.app, "editor", "p4").await;
    let (status, view) = send(
        &console.app,
        empty_request("GET", &format!("/v1/transactions/{id}"), &cookies),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["state"], "rolled_back");
}

#[tokio::test]
async fn logout_after_silent_reauth_revokes_the_original_identity() {
    let console = console(1, 1000).await;
    let (_, cookies, _) = login(&console.app, "alice", "p1").await;
    console.clock.advance(Duration::from_secs(31 * 60));
    let response = console
        .app
        .clone()
        .oneshot(empty_request("GET", "/v1/access", &cookies))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let reissued = set_cookies(&response);
    let identity = cookies
        .split("; ")
        .find(|pair| pair.starts_with("dbconsole_identity="))
        .expect("identity cookie");
    let current = format!("{}; {identity}", cookie_header(&reissued));

    let (status, _) = send(&console.app, empty_request("POST", "/v1/auth/logout", &current)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    for replay in [current.as_str(), cookies.as_str(), identity] {
        let (status, body) = send(&console.app, empty_request("GET", "/v1/access", replay)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "auth");
    }
}

#[tokio::test]
async fn reads_are_capped_and_report_the_total() {
    let console = console(5000, 1000).await;
    let (_, cookies, _) = login(&console.app, "alice", "p1").await;

    let (status, page) = send(&console.app, empty_request("GET", USERS_ROWS, &cookies)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["loaded"], 1000);
    assert_eq!(page["total"], 5000);
    assert_eq!(page["hard_cap"], 1000);
    assert_eq!(page["rows"][0][0], 1);

    let (status, page) = send(
        &console.app,
        empty_request("GET", &format!("{USERS_ROWS}?offset=1000"), &cookies),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["loaded"], 1000);
    assert_eq!(page["total"], 5000);
    assert_eq!(page["rows"][0][0], 1001);

    let (status, page) = send(
        &console.app,
        empty_request("GET", &format!("{USERS_ROWS}?offset=5000"), &cookies),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["loaded"], 0);
    assert_eq!(page["total"], 5000);
}

#[tokio::test]
async fn filtered_sorted_read() {
    let console = console(20, 1000).await;
    let (_, cookies, _) = login(&console.app, "alice", "p1").await;
    let (status, page) = send(
        &console.app,
        empty_request(
            "GET",
            &format!("{USERS_ROWS}?filter=id%20%3C%3D%205&sort=id&order=desc&limit=2"),
            &cookies,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 5);
    assert_eq!(page["loaded"], 2);
    assert_eq!(page["rows"][0][0], 5);
    assert_eq!(page["rows"][1][0], 4);
}

#[tokio::test]
async fn injected_filter_is_rejected() {
    let console = console(20, 1000).await;
    let (_, cookies, _) = login(&console.app, "alice", "p1").await;
    let (status, body) = send(
        &console.app,
        empty_request(
            "GET",
            &format!("{USERS_ROWS}?filter=1%3B%20DROP%20TABLE%20x"),
            &cookies,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation");

    let (status, _) = send(
        &console.app,
        empty_request(
            "GET",
            &format!("{USERS_ROWS}?filter=name%20%3D%20%27O%27%27Brien%27"),
            &cookies,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn ad_hoc_select_binds_parameters() {
    let console = console(20, 1000).await;
    let (_, cookies, _) = login(&console.app, "alice", "p1").await;
    let (status, body) = send(
        &console.app,
        json_request(
            "POST",
            "/v1/query",
            &cookies,
            json!({"sql": "SELECT id, name FROM users WHERE id = $1", "params": [7]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["error"].is_null());
    let result = &body["results"][0]["result"];
    assert_eq!(result["columns"], json!(["id", "name"]));
    assert_eq!(result["rows"], json!([[7, "old"]]));
}

#[tokio::test]
async fn ad_hoc_batch_stops_at_the_first_failure() {
    let console = console(5, 1000).await;
    let (_, cookies, _) = login(&console.app, "alice", "p1").await;
    let (status, body) = send(
        &console.app,
        json_request(
            "POST",
            "/v1/query",
            &cookies,
            json!({"sql": "SELECT id FROM users; DELETE FROM users; SELECT 1"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"].as_array().expect("results").len(), 1);
    assert_eq!(body["error"]["index"], 1);
    assert_eq!(body["error"]["code"], "backend_denied");
    assert_eq!(console.backend.rows(&users()).await.expect("rows").len(), 5);
}

#[tokio::test]
async fn ad_hoc_transaction_control_is_rejected() {
    let console = console(1, 1000).await;
    let (_, cookies, _) = login(&console.app, "editor", "p4").await;
    let (status, body) = send(
        &console.app,
        json_request("POST", "/v1/query", &cookies, json!({"sql": "BEGIN"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation");
}

#[tokio::test]
async fn responses_carry_a_request_id() {
    let console = console(0, 1000).await;
    let response = console
        .app
        .clone()
        .oneshot(empty_request("GET", "/v1/system/health", ""))
        .await
        .expect("health");
    assert!(response.headers().contains_key("x-request-id"));
}

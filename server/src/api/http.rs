use axum::{
    body::Bytes,
    extract::{Query, State as AxumState},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tapledger_types::PlayerRecord;

use crate::metrics::StoreMetricsSnapshot;
use crate::store::StoreOptions;
use crate::{Error, Ledger};

#[derive(Serialize)]
struct HealthzResponse {
    ok: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct SaveResponse {
    status: &'static str,
    saved_data: PlayerRecord,
}

#[derive(Serialize)]
struct WipeResponse {
    deleted: usize,
}

#[derive(Serialize)]
struct StoreMetricsResponse {
    backend: &'static str,
    options: StoreOptions,
    counters: StoreMetricsSnapshot,
}

#[derive(Deserialize)]
pub(super) struct GetDataParams {
    user_id: Option<String>,
    username: Option<String>,
}

#[derive(Deserialize)]
pub(super) struct TopPlayersParams {
    limit: Option<String>,
}

pub(super) async fn healthz() -> Response {
    Json(HealthzResponse { ok: true }).into_response()
}

/// Returns the caller's record, creating it on first contact.
pub(super) async fn get_data(
    AxumState(ledger): AxumState<Arc<Ledger>>,
    Query(params): Query<GetDataParams>,
) -> Response {
    let start = Instant::now();
    let GetDataParams { user_id, username } = params;
    let Some(key) = user_id.filter(|key| !key.trim().is_empty()) else {
        return json_error(StatusCode::BAD_REQUEST, "missing user_id");
    };
    let result = ledger
        .blocking(move |store| store.get_or_create(&key, username.as_deref()))
        .await;
    ledger.http_metrics().record_get_data(start.elapsed());
    match result {
        Ok(record) => Json(record).into_response(),
        Err(err) => error_response(err),
    }
}

/// Merges `data` into the record for `user_id`. The key may be sent as a
/// JSON string or number.
pub(super) async fn save_data(
    AxumState(ledger): AxumState<Arc<Ledger>>,
    body: Bytes,
) -> Response {
    let start = Instant::now();
    let body: Value = match serde_json::from_slice(&body) {
        Ok(body) => body,
        Err(err) => {
            return json_error(StatusCode::BAD_REQUEST, &format!("invalid JSON body: {err}"))
        }
    };
    let Some(key) = player_key(body.get("user_id")) else {
        return json_error(StatusCode::BAD_REQUEST, "missing user_id");
    };
    let data = match body.get("data") {
        Some(Value::Null) | None => return json_error(StatusCode::BAD_REQUEST, "missing data"),
        Some(data) => data.clone(),
    };

    let result = ledger.blocking(move |store| store.upsert(&key, &data)).await;
    ledger.http_metrics().record_save_data(start.elapsed());
    match result {
        Ok(record) => Json(SaveResponse {
            status: "ok",
            saved_data: record,
        })
        .into_response(),
        Err(err) => error_response(err),
    }
}

pub(super) async fn get_top_players(
    AxumState(ledger): AxumState<Arc<Ledger>>,
    Query(params): Query<TopPlayersParams>,
) -> Response {
    let start = Instant::now();
    let requested = match params.limit.as_deref().map(str::parse::<usize>) {
        None => None,
        Some(Ok(limit)) => Some(limit),
        Some(Err(_)) => {
            return json_error(StatusCode::BAD_REQUEST, "limit must be a non-negative integer")
        }
    };
    let limit = ledger.config.leaderboard_limit(requested);
    let result = ledger.blocking(move |store| store.top_players(limit)).await;
    ledger.http_metrics().record_top_players(start.elapsed());
    match result {
        Ok(entries) => Json(entries).into_response(),
        Err(err) => error_response(err),
    }
}

pub(super) async fn get_global_stats(AxumState(ledger): AxumState<Arc<Ledger>>) -> Response {
    let start = Instant::now();
    let result = ledger.blocking(|store| store.global_stats()).await;
    ledger.http_metrics().record_global_stats(start.elapsed());
    match result {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => error_response(err),
    }
}

pub(super) async fn reset_daily(
    headers: HeaderMap,
    AxumState(ledger): AxumState<Arc<Ledger>>,
) -> Response {
    if let Some(denied) = admin_auth_error(&ledger, &headers) {
        return denied;
    }
    match ledger.blocking(|store| store.reset_daily()).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => error_response(err),
    }
}

pub(super) async fn wipe(headers: HeaderMap, AxumState(ledger): AxumState<Arc<Ledger>>) -> Response {
    if let Some(denied) = admin_auth_error(&ledger, &headers) {
        return denied;
    }
    match ledger.blocking(|store| store.delete_all()).await {
        Ok(deleted) => Json(WipeResponse { deleted }).into_response(),
        Err(err) => error_response(err),
    }
}

pub(super) async fn store_metrics(
    headers: HeaderMap,
    AxumState(ledger): AxumState<Arc<Ledger>>,
) -> Response {
    if let Some(status) = metrics_auth_error(&ledger, &headers) {
        return status.into_response();
    }
    let store = ledger.store();
    Json(StoreMetricsResponse {
        backend: store.backend_name(),
        options: store.options(),
        counters: store.metrics().snapshot(),
    })
    .into_response()
}

pub(super) async fn http_metrics(
    headers: HeaderMap,
    AxumState(ledger): AxumState<Arc<Ledger>>,
) -> Response {
    if let Some(status) = metrics_auth_error(&ledger, &headers) {
        return status.into_response();
    }
    Json(ledger.http_metrics().snapshot()).into_response()
}

/// Player keys are text. Numeric keys are accepted and kept in their
/// textual form.
fn player_key(value: Option<&Value>) -> Option<String> {
    let key = match value? {
        Value::String(key) => key.clone(),
        Value::Number(number) => number.to_string(),
        _ => return None,
    };
    (!key.trim().is_empty()).then_some(key)
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn error_response(err: Error) -> Response {
    match err {
        Error::InvalidInput(message) => json_error(StatusCode::BAD_REQUEST, &message),
        Error::Storage(err) => {
            tracing::error!("store request failed: {err:#}");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "storage unavailable")
        }
    }
}

/// Whether either the bearer token or the `name` header carries `token`.
fn token_matches(headers: &HeaderMap, name: &str, token: &str) -> bool {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    let header_token = headers.get(name).and_then(|value| value.to_str().ok());
    bearer == Some(token) || header_token == Some(token)
}

/// Admin routes stay closed until an admin token is configured.
fn admin_auth_error(ledger: &Ledger, headers: &HeaderMap) -> Option<Response> {
    let Some(token) = ledger.config.admin_token.as_deref().filter(|token| !token.is_empty())
    else {
        return Some(json_error(StatusCode::FORBIDDEN, "admin routes are disabled"));
    };
    if token_matches(headers, "x-admin-token", token) {
        None
    } else {
        Some(json_error(StatusCode::UNAUTHORIZED, "invalid admin token"))
    }
}

fn metrics_auth_error(ledger: &Ledger, headers: &HeaderMap) -> Option<StatusCode> {
    let token = ledger.config.metrics_token.as_deref().unwrap_or_default();
    if token.is_empty() || token_matches(headers, "x-metrics-token", token) {
        None
    } else {
        Some(StatusCode::UNAUTHORIZED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Api, ProgressStore, ServerConfig};
    use axum::body::Body;
    use axum::http::Request;
    use axum::Router;
    use serde_json::json;
    use tower::ServiceExt;

    fn app(config: ServerConfig) -> (Router, Arc<Ledger>) {
        let ledger = Arc::new(Ledger::new(config, ProgressStore::in_memory()));
        (Api::new(Arc::clone(&ledger)).router(), ledger)
    }

    async fn call(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn admin_post(uri: &str, token: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("x-admin-token", token)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn get_data_creates_default_record() {
        let (router, _) = app(ServerConfig::default());
        let (status, body) = call(&router, get("/get_data?user_id=42&username=Ann")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["key"], "42");
        assert_eq!(body["nickname"], "Ann");
        assert_eq!(body["perClick"], 1.0);
        assert_eq!(body["ads_watched"]["inAppTotal"], 0);
    }

    #[tokio::test]
    async fn missing_user_id_is_bad_request() {
        let (router, _) = app(ServerConfig::default());
        let (status, body) = call(&router, get("/get_data")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (status, _) = call(&router, post_json("/save_data", json!({"data": {}}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn numeric_user_id_is_saved_under_text_key() {
        let (router, _) = app(ServerConfig::default());
        let (status, body) = call(
            &router,
            post_json(
                "/save_data",
                json!({"user_id": 555, "data": {"balance": 10, "username": "Ann"}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["saved_data"]["balance"], 10.0);

        let (_, body) = call(&router, get("/get_data?user_id=555")).await;
        assert_eq!(body["balance"], 10.0);
        assert_eq!(body["nickname"], "Ann");
    }

    #[tokio::test]
    async fn bad_save_payloads_are_rejected() {
        let (router, ledger) = app(ServerConfig::default());
        for body in [
            json!({"user_id": "1", "data": [1, 2]}),
            json!({"user_id": "1", "data": {"balance": "lots"}}),
            json!({"user_id": "1"}),
            json!({"user_id": true, "data": {}}),
        ] {
            let (status, _) = call(&router, post_json("/save_data", body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
        }
        let request = Request::builder()
            .method("POST")
            .uri("/save_data")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, _) = call(&router, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(ledger.store().count().unwrap(), 0);
    }

    #[tokio::test]
    async fn leaderboard_and_stats() {
        let (router, _) = app(ServerConfig::default());
        for (id, earned) in [("a", 100), ("b", 50), ("c", 200)] {
            call(
                &router,
                post_json(
                    "/save_data",
                    json!({"user_id": id, "data": {"nickname": id, "totalEarned": earned, "totalClicks": 1}}),
                ),
            )
            .await;
        }

        let (status, body) = call(&router, get("/get_top_players?limit=2")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!([
                {"nickname": "c", "totalEarned": 200.0},
                {"nickname": "a", "totalEarned": 100.0}
            ])
        );
        let (status, _) = call(&router, get("/get_top_players?limit=lots")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&router, get("/get_global_stats")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["users"], 3);
        assert_eq!(body["totalEarned"], 350.0);
        assert_eq!(body["totalClicks"], 3);
    }

    #[tokio::test]
    async fn admin_routes_need_configured_token() {
        let (router, _) = app(ServerConfig::default());
        let (status, _) = call(&router, admin_post("/admin/wipe", "anything")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (router, ledger) = app(ServerConfig {
            admin_token: Some("sesame".to_string()),
            ..ServerConfig::default()
        });
        call(&router, get("/get_data?user_id=1")).await;
        let (status, _) = call(&router, admin_post("/admin/reset_daily", "wrong")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = call(&router, admin_post("/admin/reset_daily", "sesame")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reset"], 1);

        let (status, body) = call(&router, admin_post("/admin/wipe", "sesame")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"], 1);
        assert_eq!(ledger.store().count().unwrap(), 0);
    }

    #[tokio::test]
    async fn metrics_report_store_counters() {
        let (router, _) = app(ServerConfig {
            metrics_token: Some("peek".to_string()),
            ..ServerConfig::default()
        });
        call(&router, get("/get_data?user_id=9")).await;

        let (status, _) = call(&router, get("/metrics/store")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .uri("/metrics/store")
            .header("x-metrics-token", "peek")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(&router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["backend"], "memory");
        assert_eq!(body["counters"]["records_created"], 1);
    }

    #[tokio::test]
    async fn responses_carry_request_id() {
        let (router, _) = app(ServerConfig::default());
        let request = Request::builder()
            .uri("/healthz")
            .header("x-request-id", "abc-123")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.headers()["x-request-id"], "abc-123");
    }

    #[test]
    fn player_key_accepts_strings_and_numbers() {
        assert_eq!(player_key(Some(&json!("77"))).as_deref(), Some("77"));
        assert_eq!(player_key(Some(&json!(77))).as_deref(), Some("77"));
        assert_eq!(player_key(Some(&json!(""))), None);
        assert_eq!(player_key(Some(&json!(null))), None);
        assert_eq!(player_key(None), None);
    }

    #[tokio::test]
    async fn admin_header_counts_alongside_unrelated_bearer() {
        let (router, _) = app(ServerConfig {
            admin_token: Some("sesame".to_string()),
            ..ServerConfig::default()
        });
        let request = Request::builder()
            .method("POST")
            .uri("/admin/reset_daily")
            .header("authorization", "Bearer gateway-session")
            .header("x-admin-token", "sesame")
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(&router, request).await;
        assert_eq!(status, StatusCode::OK);

        let request = Request::builder()
            .method("POST")
            .uri("/admin/reset_daily")
            .header("authorization", "Bearer sesame")
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(&router, request).await;
        assert_eq!(status, StatusCode::OK);
    }
}

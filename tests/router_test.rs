mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use stk_api::routes::build_router;
use stk_api::state::AppState;
use tower::ServiceExt;

use common::{Harness, ADMIN_GROUP};

fn app(h: &Harness) -> Router {
    build_router(AppState::new(h.service.clone()))
}

fn bearer(h: &Harness, group: &str) -> String {
    let token = h
        .auth
        .gen_token("user-1", group, chrono::Duration::hours(1))
        .unwrap();
    format!("Bearer {}", token)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn callback_body() -> String {
    json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "m-ws_1",
                "CheckoutRequestID": "ws_1",
                "ResultCode": 1032,
                "ResultDesc": "Request cancelled by user"
            }
        }
    })
    .to_string()
}

#[tokio::test]
async fn health_check_is_public() {
    let h = Harness::new();
    let response = app(&h)
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "healthy");
}

#[tokio::test]
async fn callback_requires_json_content_type() {
    let h = Harness::new();
    let response = app(&h)
        .oneshot(
            Request::post("/api/mpesa/callback")
                .header(header::CONTENT_TYPE, "text/plain")
                .body(Body::from(callback_body()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(h.store.all().await.is_empty());
}

#[tokio::test]
async fn callback_is_acknowledged() {
    let h = Harness::new();
    h.accepted("0712345678", "ws_1").await;

    let response = app(&h)
        .oneshot(
            Request::post("/api/mpesa/callback")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(callback_body()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["ResultCode"], 0);
    assert_eq!(body["ResultDesc"], "Accepted");
}

#[tokio::test]
async fn malformed_callback_is_a_bad_request() {
    let h = Harness::new();
    let response = app(&h)
        .oneshot(
            Request::post("/api/mpesa/callback")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{\"Body\":"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn stk_routes_require_a_bearer_token() {
    let h = Harness::new();
    let response = app(&h)
        .oneshot(
            Request::post("/api/stk/initiate")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn initiate_then_fetch_over_http() {
    let h = Harness::new();
    h.api.script_push(common::PushScript::Accept("ws_1".into()));
    let auth = bearer(&h, "users");

    let body = json!({
        "initiator_id": "user-1",
        "phone": "0712345678",
        "amount": 100,
        "account_reference": "INV-1"
    });
    let response = app(&h)
        .oneshot(
            Request::post("/api/stk/initiate")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::AUTHORIZATION, &auth)
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["progress"], true);

    let id = h.store.all().await[0].id;
    let response = app(&h)
        .oneshot(
            Request::get(format!("/api/stk/transactions/{}", id))
                .header(header::AUTHORIZATION, &auth)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["phone_number"], "+254712345678");

    let response = app(&h)
        .oneshot(
            Request::get("/api/stk/transactions/999")
                .header(header::AUTHORIZATION, &auth)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn process_endpoint_is_admin_only() {
    let h = Harness::new();
    let id = h.accepted("0712345678", "ws_1").await;
    let body = json!({ "transaction_id": id, "processed": true }).to_string();

    let response = app(&h)
        .oneshot(
            Request::post("/api/stk/transactions/process")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::AUTHORIZATION, bearer(&h, "users"))
                .body(Body::from(body.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app(&h)
        .oneshot(
            Request::post("/api/stk/transactions/process")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::AUTHORIZATION, bearer(&h, ADMIN_GROUP))
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["processed"], true);
}

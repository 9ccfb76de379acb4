//! End-to-end tests over the router: envelope handling, status mapping, and
//! the streaming scenario, all driven through `tower::ServiceExt::oneshot`
//! without a live listener.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use switchboard::{
    middleware, server, Dispatcher, MethodKind, ProcedureDefinition, ProcedureHandler,
    RuntimeConfig, Schema, SchemaRegistry, ServiceDefinition, ServiceImplementationBuilder,
};

/// Percent-encode a string for use as a query parameter value.
fn urlencode(raw: &str) -> String {
    raw.bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                (b as char).to_string()
            }
            _ => format!("%{b:02X}"),
        })
        .collect()
}

struct Harness {
    router: Router,
    dispatcher: Arc<Dispatcher>,
    get_user_calls: Arc<AtomicUsize>,
}

fn harness() -> Harness {
    let definition = ServiceDefinition::new("Users")
        .with_procedure(ProcedureDefinition::new(
            "Ping",
            "returns true",
            MethodKind::Query,
            Schema::object([("id", Schema::string(), true)]),
            Schema::Boolean,
        ))
        .with_procedure(ProcedureDefinition::new(
            "GetUser",
            "fetch one user",
            MethodKind::Query,
            Schema::object([("id", Schema::string(), true)]),
            Schema::Any,
        ))
        .with_procedure(ProcedureDefinition::new(
            "StreamName",
            "push each letter of a name",
            MethodKind::Subscription,
            Schema::object([("name", Schema::string_bounded(Some(1), None), true)]),
            Schema::object([("letter", Schema::string(), true)]),
        ))
        .with_procedure(ProcedureDefinition::new(
            "Echo",
            "echo inbound messages",
            MethodKind::Bidirectional,
            Schema::object([("text", Schema::string(), true)]),
            Schema::object([("echo", Schema::string(), true)]),
        ));

    let admin_definition = ServiceDefinition::new("Admin")
        .with_procedure(ProcedureDefinition::new(
            "Reset",
            "always blocked by middleware",
            MethodKind::Mutation,
            Schema::Any,
            Schema::Boolean,
        ))
        .with_middleware_requirement("rejects every call");

    let get_user_calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&get_user_calls);

    let users = ServiceImplementationBuilder::new(Arc::new(definition.clone()))
        .handler(
            "Ping",
            ProcedureHandler::query(|_input, _info, _ctx| async { Ok(json!(true)) }),
        )
        .handler(
            "GetUser",
            ProcedureHandler::query(move |input, _info, _ctx| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"id": input.get("id").cloned().unwrap_or(Value::Null)}))
                }
            }),
        )
        .handler(
            "StreamName",
            ProcedureHandler::subscription(|input, _info, _ctx, connection| async move {
                let name = input
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                for letter in name.chars() {
                    connection.write(&json!({"letter": letter.to_string()}));
                }
                connection.close();
                Ok(())
            }),
        )
        .handler(
            "Echo",
            ProcedureHandler::bidirectional(|_input, _info, _ctx, _connection| async { Ok(()) }),
        )
        .build()
        .expect("users implementation is complete");

    let admin = ServiceImplementationBuilder::new(Arc::new(admin_definition.clone()))
        .handler(
            "Reset",
            ProcedureHandler::mutation(|_input, _info, _ctx| async { Ok(json!(true)) }),
        )
        .middleware(middleware(|_info, _ctx| {
            Box::pin(async { Err(anyhow::anyhow!("rejected")) })
        }))
        .build()
        .expect("admin implementation is complete");

    let mut registry = SchemaRegistry::new();
    registry.register_service(definition);
    registry.register_service(admin_definition);

    let mut dispatcher = Dispatcher::new(registry, Duration::from_secs(3600));
    dispatcher.implement("Users", users);
    dispatcher.implement("Admin", admin);
    let dispatcher = Arc::new(dispatcher);

    let config = RuntimeConfig::default();
    let router = server::build_router(Arc::clone(&dispatcher), &config);
    Harness { router, dispatcher, get_user_calls }
}

fn post_call(service: &str, procedure: &str, data: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"service": service, "procedure": procedure, "data": data}).to_string(),
        ))
        .unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_round_trip_returns_wrapped_data() {
    let harness = harness();
    let response = harness
        .router
        .oneshot(post_call(
            "Users",
            "Ping",
            json!({"id": "4d1f65a7-8c8e-4b6a-9f6e-d1a2b3c4d5e6"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body, json!({"data": true}));
}

#[tokio::test]
async fn test_unknown_procedure_is_404_naming_it() {
    let harness = harness();
    let response = harness
        .router
        .oneshot(post_call("Users", "GetUserr", json!({"id": "u1"})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(body_text(response).await.contains("GetUserr"));
}

#[tokio::test]
async fn test_unknown_service_is_404_naming_it() {
    let harness = harness();
    let response = harness
        .router
        .oneshot(post_call("Ghosts", "Ping", json!({})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(body_text(response).await.contains("Ghosts"));
}

#[tokio::test]
async fn test_validation_failure_is_400_and_skips_handler() {
    let harness = harness();
    let response = harness
        .router
        .oneshot(post_call("Users", "GetUser", json!({})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_text(response).await.contains("id"));
    assert_eq!(harness.get_user_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_malformed_envelope_is_400() {
    let harness = harness();
    let request = Request::builder()
        .method("POST")
        .uri("/api")
        .body(Body::from("this is not an envelope"))
        .unwrap();
    let response = harness.router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_middleware_failure_is_opaque_500() {
    let harness = harness();
    let response = harness
        .router
        .oneshot(post_call("Admin", "Reset", json!(null)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let text = body_text(response).await;
    assert!(!text.contains("rejected"), "500 bodies must not leak middleware detail");
}

#[tokio::test]
async fn test_outside_prefix_is_400() {
    let harness = harness();
    let request = Request::builder()
        .method("GET")
        .uri("/somewhere/else")
        .body(Body::empty())
        .unwrap();
    let response = harness.router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_bidirectional_on_plain_route_is_400() {
    let harness = harness();
    let response = harness
        .router
        .oneshot(post_call("Users", "Echo", json!({"text": "hi"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_payload_parameter_round_trip() {
    let harness = harness();
    let envelope = json!({"service": "Users", "procedure": "Ping", "data": {"id": "u1"}});
    let uri = format!("/api?payload={}", urlencode(&envelope.to_string()));
    let request = Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap();

    let response = harness.router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body, json!({"data": true}));
}

#[tokio::test]
async fn test_missing_payload_parameter_is_400() {
    let harness = harness();
    let request = Request::builder().method("GET").uri("/api").body(Body::empty()).unwrap();
    let response = harness.router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_stream_name_scenario_frames_in_order() {
    let harness = harness();
    let envelope = json!({"service": "Users", "procedure": "StreamName", "data": {"name": "ab"}});
    let uri = format!("/api?payload={}", urlencode(&envelope.to_string()));
    let request = Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap();

    let response = harness.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .starts_with("text/event-stream"));

    // The handler closes the connection, so the body ends and can be
    // collected whole.
    let text = body_text(response).await;

    let connected = text.find("Connected").expect("connected marker present");
    let letter_a = text.find(r#"{"letter":"a"}"#).expect("first content frame");
    let letter_b = text.find(r#"{"letter":"b"}"#).expect("second content frame");
    let close = text.find("event: close").expect("close frame present");
    assert!(connected < letter_a);
    assert!(letter_a < letter_b);
    assert!(letter_b < close);

    // The body finished, so the connection left the tracked set.
    tokio::task::yield_now().await;
    assert!(harness.dispatcher.connections().is_empty());
}

#[tokio::test]
async fn test_subscription_over_post_also_streams() {
    let harness = harness();
    let response = harness
        .router
        .oneshot(post_call("Users", "StreamName", json!({"name": "x"})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let text = body_text(response).await;
    assert!(text.contains(r#"{"letter":"x"}"#));
}

#[tokio::test]
async fn test_subscription_input_validation_is_400() {
    let harness = harness();
    // Empty name violates the one-character minimum.
    let response = harness
        .router
        .oneshot(post_call("Users", "StreamName", json!({"name": ""})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

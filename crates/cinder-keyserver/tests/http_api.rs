use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use cinder_crypto::encoding::encode;
use cinder_crypto::{EphemeralKeyPair, KeyMaterial};
use cinder_keyserver::http::{router, ACTOR_HEADER};
use cinder_keyserver::{KeyServer, KeyServerConfig};
use serde_json::{json, Value};
use tower::ServiceExt;

fn app() -> Router {
    router(Arc::new(KeyServer::in_memory(KeyServerConfig::default())))
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    actor: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(actor) = actor {
        builder = builder.header(ACTOR_HEADER, actor);
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn publish(app: &Router, user: &str, material: &KeyMaterial) {
    let bundle = serde_json::to_value(material.export_bundle()).unwrap();
    let (status, body) = send(app, "POST", "/keys/bundle", Some(user), Some(bundle)).await;
    assert_eq!(status, StatusCode::OK, "{body}");
}

#[tokio::test]
async fn health() {
    let (status, _) = send(&app(), "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn missing_actor_is_unauthorized() {
    let (status, body) = send(&app(), "GET", "/keys/one-time/count", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn publish_and_fetch_bundle() {
    let app = app();
    let bob = KeyMaterial::generate(3);
    let bundle = serde_json::to_value(bob.export_bundle()).unwrap();

    let (status, receipt) = send(&app, "POST", "/keys/bundle", Some("bob"), Some(bundle)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(receipt["trust"], "verified");
    assert_eq!(receipt["inserted"].as_array().unwrap().len(), 3);

    let (status, fetched) = send(&app, "GET", "/keys/bob/bundle", Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["identityKey"], encode(&bob.identity.public_key));
    assert_eq!(fetched["oneTimePreKeys"].as_array().unwrap().len(), 3);

    // Fetching consumed nothing.
    let (_, count) = send(&app, "GET", "/keys/one-time/count", Some("bob"), None).await;
    assert_eq!(count["count"], 3);

    let (status, _) = send(&app, "GET", "/keys/nobody/bundle", Some("alice"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn bad_bundles_are_rejected() {
    let app = app();
    let mut bundle = serde_json::to_value(KeyMaterial::generate(1).export_bundle()).unwrap();

    let mut incomplete = bundle.clone();
    incomplete.as_object_mut().unwrap().remove("signedPreKey");
    let (status, _) = send(&app, "POST", "/keys/bundle", Some("bob"), Some(incomplete)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    bundle["signedPreKeySignature"] = json!(encode(&[0u8; 64]));
    let (status, body) = send(&app, "POST", "/keys/bundle", Some("bob"), Some(bundle.clone())).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().contains("signature"));

    // Without a signing key the same bundle is accepted, flagged unverified.
    bundle.as_object_mut().unwrap().remove("signingPublicKey");
    let (status, receipt) = send(&app, "POST", "/keys/bundle", Some("bob"), Some(bundle)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(receipt["trust"], "unverified");
}

#[tokio::test]
async fn replenish_and_explicit_consume() {
    let app = app();
    let mut bob = KeyMaterial::generate(1);
    publish(&app, "bob", &bob).await;

    let fresh = serde_json::to_value(bob.replenish(2)).unwrap();
    let body = json!({ "oneTimePreKeys": fresh });
    let (status, report) = send(&app, "POST", "/keys/one-time", Some("bob"), Some(body.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["inserted"], json!(["otpk-1", "otpk-2"]));

    let (_, report) = send(&app, "POST", "/keys/one-time", Some("bob"), Some(body)).await;
    assert_eq!(report["rejected"], json!(["otpk-1", "otpk-2"]));

    let consume = json!({ "userId": "bob", "oneTimePreKeyId": "otpk-2" });
    let (status, _) = send(&app, "POST", "/keys/one-time/consume", Some("alice"), Some(consume.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, consumed) = send(&app, "POST", "/keys/one-time/consume", Some("bob"), Some(consume.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(consumed["oneTimePreKeyId"], "otpk-2");

    let (status, _) = send(&app, "POST", "/keys/one-time/consume", Some("bob"), Some(consume)).await;
    assert_eq!(status, StatusCode::GONE);

    let (_, count) = send(&app, "GET", "/keys/one-time/count", Some("bob"), None).await;
    assert_eq!(count["count"], 2);
}

#[tokio::test]
async fn session_lifecycle_over_http() {
    let app = app();
    let bob = KeyMaterial::generate(1);
    publish(&app, "bob", &bob).await;

    let alice = KeyMaterial::generate(0);
    let eph = EphemeralKeyPair::generate();
    let initiate = json!({
        "recipient": "bob",
        "initiatorIdentityKey": encode(&alice.identity.public_key),
        "initiatorEphemeralKey": encode(&eph.public_key),
    });
    let (status, opened) = send(&app, "POST", "/sessions", Some("alice"), Some(initiate)).await;
    assert_eq!(status, StatusCode::OK, "{opened}");
    assert_eq!(opened["usedOneTimePreKeyId"], "otpk-0");
    let snapshot_keys = opened["recipientBundleSnapshot"]["oneTimePreKeys"].as_array().unwrap();
    assert_eq!(snapshot_keys.len(), 1);
    let session_id = opened["sessionId"].as_str().unwrap().to_owned();
    let session_uri = format!("/sessions/{session_id}");

    let (status, pending) = send(&app, "GET", &session_uri, Some("bob"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pending, json!({ "status": "pending" }));

    let (status, _) = send(&app, "GET", &session_uri, Some("mallory"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (_, listed) = send(&app, "GET", "/sessions?state=initiated", Some("bob"), None).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["sessionId"], session_id.as_str());

    let finalize = json!({
        "sessionId": session_id,
        "initiatorIdentityKey": encode(&alice.identity.public_key),
        "initiatorEphemeralKey": encode(&eph.public_key),
    });
    let (status, _) = send(&app, "POST", "/sessions/finalize", Some("bob"), Some(finalize.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, ack) = send(&app, "POST", "/sessions/finalize", Some("alice"), Some(finalize.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack, json!({ "ok": true }));

    let (status, _) = send(&app, "POST", "/sessions/finalize", Some("alice"), Some(finalize)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, ready) = send(&app, "GET", &session_uri, Some("bob"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ready["status"], "ready");
    assert_eq!(ready["initiator"], "alice");
    assert_eq!(ready["oneTimePreKeyId"], "otpk-0");
    assert_eq!(ready["initiatorEphemeralKey"], encode(&eph.public_key));

    let (status, _) = send(&app, "GET", "/sessions/unknown", Some("bob"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_session_request_is_bad_request() {
    let app = app();
    let body = json!({ "recipient": "bob", "initiatorIdentityKey": "not base64!" });
    let (status, _) = send(&app, "POST", "/sessions", Some("alice"), Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

//! HTTP boundary for the key server.
//!
//! Authentication is someone else's job: whoever sits in front of this router
//! sets the `x-cinder-user` header to the authenticated user id.

#![allow(clippy::unused_async)] // axum handlers

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequestParts, Path, Query, State as AxumState};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use cinder_crypto::Bundle;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::ServerError;
use crate::service::{
    Ack, ConsumeRequest, ConsumeResponse, FinalizeRequest, InitiateRequest, InitiateResponse,
    KeyServer, PrekeyCount, PublishReceipt, ReplenishRequest,
};
use crate::session::{SessionMaterial, SessionState, SessionSummary};
use crate::store::InsertReport;

pub const ACTOR_HEADER: &str = "x-cinder-user";

type SharedServer = Arc<KeyServer>;

/// The authenticated caller, from [`ACTOR_HEADER`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor(pub String);

impl<S: Send + Sync> FromRequestParts<S> for Actor {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(ACTOR_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|user| !user.is_empty())
            .map(|user| Actor(user.to_owned()))
            .ok_or(ServerError::Unauthenticated)
    }
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BundleIncomplete(_) | Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::BundleNotFound(_) | Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::AlreadyFinalized(_) | Self::SessionMaterialMismatch => StatusCode::CONFLICT,
            Self::PrekeyGone(_) => StatusCode::GONE,
            Self::InvalidSignature | Self::Crypto => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Config(_) | Self::Storage(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
            "internal error".to_owned()
        } else {
            tracing::debug!(error = %self, "request rejected");
            self.to_string()
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn bad_body(rejection: &JsonRejection) -> ServerError {
    ServerError::InvalidRequest(rejection.body_text())
}

pub fn router(server: SharedServer) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/keys/bundle", post(publish_bundle))
        .route("/keys/{user_id}/bundle", get(fetch_bundle))
        .route("/keys/one-time", post(replenish))
        .route("/keys/one-time/count", get(prekey_count))
        .route("/keys/one-time/consume", post(consume_prekey))
        .route("/sessions", post(initiate_session).get(list_sessions))
        .route("/sessions/finalize", post(finalize_session))
        .route("/sessions/{session_id}", get(fetch_session))
        .route("/health", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(server)
}

async fn publish_bundle(
    AxumState(server): AxumState<SharedServer>,
    Actor(user): Actor,
    body: Result<Json<Bundle>, JsonRejection>,
) -> Result<Json<PublishReceipt>, ServerError> {
    // A bundle that does not parse is missing or mangling a required field.
    let Json(bundle) = body.map_err(|e| ServerError::BundleIncomplete(e.body_text()))?;
    Ok(Json(server.publish_bundle(&user, &bundle)?))
}

async fn fetch_bundle(
    AxumState(server): AxumState<SharedServer>,
    _actor: Actor,
    Path(user_id): Path<String>,
) -> Result<Json<Bundle>, ServerError> {
    Ok(Json(server.fetch_bundle(&user_id)?))
}

async fn replenish(
    AxumState(server): AxumState<SharedServer>,
    Actor(user): Actor,
    body: Result<Json<ReplenishRequest>, JsonRejection>,
) -> Result<Json<InsertReport>, ServerError> {
    let Json(request) = body.map_err(|e| bad_body(&e))?;
    Ok(Json(server.replenish(&user, &request.one_time_pre_keys)?))
}

async fn prekey_count(
    AxumState(server): AxumState<SharedServer>,
    Actor(user): Actor,
) -> Result<Json<PrekeyCount>, ServerError> {
    Ok(Json(server.prekey_count(&user)?))
}

async fn consume_prekey(
    AxumState(server): AxumState<SharedServer>,
    Actor(owner): Actor,
    body: Result<Json<ConsumeRequest>, JsonRejection>,
) -> Result<Json<ConsumeResponse>, ServerError> {
    let Json(request) = body.map_err(|e| bad_body(&e))?;
    Ok(Json(server.consume_prekey(&owner, &request)?))
}

async fn initiate_session(
    AxumState(server): AxumState<SharedServer>,
    Actor(initiator): Actor,
    body: Result<Json<InitiateRequest>, JsonRejection>,
) -> Result<Json<InitiateResponse>, ServerError> {
    let Json(request) = body.map_err(|e| bad_body(&e))?;
    Ok(Json(server.initiate_session(&initiator, request)?))
}

async fn finalize_session(
    AxumState(server): AxumState<SharedServer>,
    Actor(caller): Actor,
    body: Result<Json<FinalizeRequest>, JsonRejection>,
) -> Result<Json<Ack>, ServerError> {
    let Json(request) = body.map_err(|e| bad_body(&e))?;
    Ok(Json(server.finalize_session(&caller, &request)?))
}

#[derive(Debug, Deserialize)]
struct ListSessionsQuery {
    state: Option<SessionState>,
}

async fn list_sessions(
    AxumState(server): AxumState<SharedServer>,
    Actor(recipient): Actor,
    Query(query): Query<ListSessionsQuery>,
) -> Result<Json<Vec<SessionSummary>>, ServerError> {
    Ok(Json(server.sessions_for(&recipient, query.state)?))
}

async fn fetch_session(
    AxumState(server): AxumState<SharedServer>,
    Actor(caller): Actor,
    Path(session_id): Path<String>,
) -> Result<Json<SessionMaterial>, ServerError> {
    Ok(Json(server.fetch_session(&caller, &session_id)?))
}

//! Session lifecycle: `Initiated` -> `Finalized`, nothing else.

use cinder_crypto::encoding::base64_array;
use cinder_crypto::primitives::KEY_LEN;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::db::timestamp_now;
use crate::error::ServerError;
use crate::store::SessionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Initiated,
    Finalized,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Finalized => "finalized",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initiated" => Some(Self::Initiated),
            "finalized" => Some(Self::Finalized),
            _ => None,
        }
    }
}

/// Persisted record of one handshake attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub initiator: String,
    pub recipient: String,
    pub conversation_id: String,
    pub one_time_pre_key_id: Option<String>,
    pub initiator_identity_key: [u8; KEY_LEN],
    pub initiator_ephemeral_key: [u8; KEY_LEN],
    pub state: SessionState,
    pub created_at: i64,
}

/// What the initiator hands over for the responder's half of the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatorMaterial {
    pub session_id: String,
    pub initiator: String,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_pre_key_id: Option<String>,
    #[serde(with = "base64_array")]
    pub initiator_identity_key: [u8; KEY_LEN],
    #[serde(with = "base64_array")]
    pub initiator_ephemeral_key: [u8; KEY_LEN],
}

/// Responder view of a session: nothing until the initiator finalizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SessionMaterial {
    Pending,
    Ready(InitiatorMaterial),
}

/// Listing entry for responder discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub initiator: String,
    pub conversation_id: String,
    pub state: SessionState,
    pub created_at: i64,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.id.clone(),
            initiator: session.initiator.clone(),
            conversation_id: session.conversation_id.clone(),
            state: session.state,
            created_at: session.created_at,
        }
    }
}

/// Conversation id two users get when neither side names one. Independent of
/// who initiates.
pub fn default_conversation_id(a: &str, b: &str) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = Sha256::new();
    hasher.update(first.as_bytes());
    hasher.update([0u8]);
    hasher.update(second.as_bytes());
    hex::encode(hasher.finalize())
}

fn new_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Parameters recorded when a session is opened.
pub struct NewSession<'a> {
    pub initiator: &'a str,
    pub recipient: &'a str,
    pub conversation_id: Option<String>,
    pub one_time_pre_key_id: Option<String>,
    pub initiator_identity_key: [u8; KEY_LEN],
    pub initiator_ephemeral_key: [u8; KEY_LEN],
}

/// Record a new handshake attempt in `Initiated`.
pub fn initiate(store: &dyn SessionStore, params: NewSession<'_>) -> Result<Session, ServerError> {
    let conversation_id = params
        .conversation_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| default_conversation_id(params.initiator, params.recipient));

    let session = Session {
        id: new_session_id(),
        initiator: params.initiator.to_owned(),
        recipient: params.recipient.to_owned(),
        conversation_id,
        one_time_pre_key_id: params.one_time_pre_key_id,
        initiator_identity_key: params.initiator_identity_key,
        initiator_ephemeral_key: params.initiator_ephemeral_key,
        state: SessionState::Initiated,
        created_at: timestamp_now(),
    };
    store.insert_session(&session)?;

    tracing::info!(
        session = %session.id,
        initiator = %session.initiator,
        recipient = %session.recipient,
        one_time_pre_key = ?session.one_time_pre_key_id,
        "session initiated"
    );
    Ok(session)
}

/// Move a session to `Finalized`.
///
/// The keys were written once at initiate; the resubmitted copies only have
/// to match. The state flip itself is a single conditional update, so of two
/// racing finalizers exactly one wins.
pub fn finalize(
    store: &dyn SessionStore,
    session_id: &str,
    caller: &str,
    initiator_identity_key: &[u8; KEY_LEN],
    initiator_ephemeral_key: &[u8; KEY_LEN],
) -> Result<(), ServerError> {
    let session = store
        .get_session(session_id)?
        .ok_or_else(|| ServerError::SessionNotFound(session_id.to_owned()))?;

    if session.initiator != caller {
        tracing::warn!(session = %session_id, caller = %caller, "finalize by non-initiator");
        return Err(ServerError::Forbidden);
    }
    if &session.initiator_identity_key != initiator_identity_key
        || &session.initiator_ephemeral_key != initiator_ephemeral_key
    {
        return Err(ServerError::SessionMaterialMismatch);
    }

    if !store.finalize_if_initiated(session_id)? {
        return Err(ServerError::AlreadyFinalized(session_id.to_owned()));
    }

    tracing::info!(session = %session_id, "session finalized");
    Ok(())
}

/// Responder poll: `Pending` while initiated, full material once finalized.
pub fn fetch_initiator_material(
    store: &dyn SessionStore,
    session_id: &str,
    caller: &str,
) -> Result<SessionMaterial, ServerError> {
    let session = store
        .get_session(session_id)?
        .ok_or_else(|| ServerError::SessionNotFound(session_id.to_owned()))?;

    if session.recipient != caller {
        return Err(ServerError::Forbidden);
    }

    Ok(match session.state {
        SessionState::Initiated => SessionMaterial::Pending,
        SessionState::Finalized => SessionMaterial::Ready(InitiatorMaterial {
            session_id: session.id,
            initiator: session.initiator,
            conversation_id: session.conversation_id,
            one_time_pre_key_id: session.one_time_pre_key_id,
            initiator_identity_key: session.initiator_identity_key,
            initiator_ephemeral_key: session.initiator_ephemeral_key,
        }),
    })
}

//! Key server operations, independent of transport.

use std::sync::Arc;

use cinder_crypto::encoding::base64_array;
use cinder_crypto::primitives::KEY_LEN;
use cinder_crypto::{Bundle, BundleTrust, OneTimePreKeyPublic};
use serde::{Deserialize, Serialize};

use crate::cache::BundleCache;
use crate::config::KeyServerConfig;
use crate::db::timestamp_now;
use crate::error::ServerError;
use crate::session::{self, NewSession, SessionMaterial, SessionState, SessionSummary};
use crate::store::memory::MemoryStore;
use crate::store::{BundleStore, InsertReport, PrekeyStore, PublishedBundle, SessionStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishReceipt {
    pub trust: BundleTrust,
    pub inserted: Vec<String>,
    pub rejected: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplenishRequest {
    pub one_time_pre_keys: Vec<OneTimePreKeyPublic>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    /// Owner of the prekey. Defaults to the caller; naming anyone else is
    /// forbidden.
    #[serde(default)]
    pub user_id: Option<String>,
    pub one_time_pre_key_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeResponse {
    pub one_time_pre_key_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrekeyCount {
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateRequest {
    pub recipient: String,
    #[serde(with = "base64_array")]
    pub initiator_identity_key: [u8; KEY_LEN],
    #[serde(with = "base64_array")]
    pub initiator_ephemeral_key: [u8; KEY_LEN],
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateResponse {
    pub session_id: String,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_one_time_pre_key_id: Option<String>,
    /// The recipient's bundle, carrying only the prekey reserved for this
    /// session (or none).
    pub recipient_bundle_snapshot: Bundle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub session_id: String,
    #[serde(with = "base64_array")]
    pub initiator_identity_key: [u8; KEY_LEN],
    #[serde(with = "base64_array")]
    pub initiator_ephemeral_key: [u8; KEY_LEN],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

impl Ack {
    pub const OK: Self = Self { ok: true };
}

pub struct KeyServer {
    bundles: BundleCache,
    prekeys: Arc<dyn PrekeyStore>,
    sessions: Arc<dyn SessionStore>,
    config: KeyServerConfig,
}

impl KeyServer {
    /// Build a server over one backend that implements every store trait.
    pub fn new<S>(store: Arc<S>, config: KeyServerConfig) -> Self
    where
        S: BundleStore + PrekeyStore + SessionStore + 'static,
    {
        let bundles: Arc<dyn BundleStore> = store.clone();
        let prekeys: Arc<dyn PrekeyStore> = store.clone();
        let sessions: Arc<dyn SessionStore> = store;
        Self {
            bundles: BundleCache::new(bundles),
            prekeys,
            sessions,
            config,
        }
    }

    pub fn in_memory(config: KeyServerConfig) -> Self {
        Self::new(Arc::new(MemoryStore::new()), config)
    }

    pub fn config(&self) -> &KeyServerConfig {
        &self.config
    }

    fn check_batch(&self, prekeys: &[OneTimePreKeyPublic]) -> Result<(), ServerError> {
        if prekeys.len() > self.config.max_upload_batch {
            return Err(ServerError::InvalidRequest(format!(
                "at most {} one-time prekeys per upload, got {}",
                self.config.max_upload_batch,
                prekeys.len()
            )));
        }
        if prekeys.iter().any(|k| k.id.is_empty()) {
            return Err(ServerError::BundleIncomplete(
                "one-time prekey with empty id".into(),
            ));
        }
        Ok(())
    }

    /// Publish (or replace) `user_id`'s bundle and append its one-time
    /// prekeys. A bad signature rejects the whole upload.
    pub fn publish_bundle(
        &self,
        user_id: &str,
        bundle: &Bundle,
    ) -> Result<PublishReceipt, ServerError> {
        self.check_batch(&bundle.one_time_pre_keys)?;
        let trust = bundle.verify()?;
        if trust == BundleTrust::Unverified {
            tracing::warn!(user = %user_id, "bundle published without a signing key");
        }

        let record = PublishedBundle {
            bundle: bundle.without_one_time_pre_keys(),
            trust,
            published_at: timestamp_now(),
        };
        self.bundles.put(user_id, record)?;
        let report = self.prekeys.insert_many(user_id, &bundle.one_time_pre_keys)?;

        tracing::info!(
            user = %user_id,
            trust = ?trust,
            inserted = report.inserted.len(),
            rejected = report.rejected.len(),
            "bundle published"
        );
        Ok(PublishReceipt {
            trust,
            inserted: report.inserted,
            rejected: report.rejected,
        })
    }

    /// Bundle plus up to `bundle_prekey_limit` unconsumed prekeys. Consumes
    /// nothing.
    pub fn fetch_bundle(&self, user_id: &str) -> Result<Bundle, ServerError> {
        let record = self
            .bundles
            .get(user_id)?
            .ok_or_else(|| ServerError::BundleNotFound(user_id.to_owned()))?;
        let mut bundle = record.bundle.clone();
        bundle.one_time_pre_keys = self
            .prekeys
            .list_unconsumed(user_id, self.config.bundle_prekey_limit)?;
        Ok(bundle)
    }

    /// Append prekeys to an already published bundle.
    pub fn replenish(
        &self,
        user_id: &str,
        prekeys: &[OneTimePreKeyPublic],
    ) -> Result<InsertReport, ServerError> {
        self.check_batch(prekeys)?;
        if self.bundles.get(user_id)?.is_none() {
            return Err(ServerError::BundleNotFound(user_id.to_owned()));
        }
        let report = self.prekeys.insert_many(user_id, prekeys)?;
        tracing::info!(
            user = %user_id,
            inserted = report.inserted.len(),
            rejected = report.rejected.len(),
            "one-time prekeys replenished"
        );
        Ok(report)
    }

    pub fn prekey_count(&self, user_id: &str) -> Result<PrekeyCount, ServerError> {
        Ok(PrekeyCount {
            count: self.prekeys.count_unconsumed(user_id)?,
        })
    }

    /// Retire one of the caller's own prekeys by id. Only the owner may do
    /// this; initiators get their prekey through [`Self::initiate_session`].
    pub fn consume_prekey(
        &self,
        caller: &str,
        request: &ConsumeRequest,
    ) -> Result<ConsumeResponse, ServerError> {
        let owner = request.user_id.as_deref().unwrap_or(caller);
        if owner != caller {
            tracing::warn!(caller = %caller, owner = %owner, "consume of another user's prekey");
            return Err(ServerError::Forbidden);
        }

        self.prekeys
            .mark_consumed(owner, &request.one_time_pre_key_id)?;
        tracing::info!(
            user = %owner,
            prekey = %request.one_time_pre_key_id,
            "one-time prekey consumed"
        );
        Ok(ConsumeResponse {
            one_time_pre_key_id: request.one_time_pre_key_id.clone(),
        })
    }

    /// Reserve one of the recipient's prekeys (if any are left) and open a
    /// session. Running out of prekeys is not an error: the snapshot simply
    /// carries none and the handshake proceeds with three terms.
    pub fn initiate_session(
        &self,
        initiator: &str,
        request: InitiateRequest,
    ) -> Result<InitiateResponse, ServerError> {
        if request.recipient.is_empty() {
            return Err(ServerError::InvalidRequest("recipient is required".into()));
        }
        if request.recipient == initiator {
            return Err(ServerError::InvalidRequest(
                "cannot open a session with yourself".into(),
            ));
        }

        let record = self
            .bundles
            .get(&request.recipient)?
            .ok_or_else(|| ServerError::BundleNotFound(request.recipient.clone()))?;

        let reserved = self.prekeys.reserve_one(&request.recipient)?;
        if reserved.is_none() {
            tracing::info!(
                recipient = %request.recipient,
                "recipient has no one-time prekeys left, continuing without one"
            );
        }

        let mut snapshot = record.bundle.clone();
        snapshot.one_time_pre_keys = reserved.iter().cloned().collect();

        let session = session::initiate(
            self.sessions.as_ref(),
            NewSession {
                initiator,
                recipient: &request.recipient,
                conversation_id: request.conversation_id,
                one_time_pre_key_id: reserved.map(|k| k.id),
                initiator_identity_key: request.initiator_identity_key,
                initiator_ephemeral_key: request.initiator_ephemeral_key,
            },
        )?;

        Ok(InitiateResponse {
            session_id: session.id,
            conversation_id: session.conversation_id,
            used_one_time_pre_key_id: session.one_time_pre_key_id,
            recipient_bundle_snapshot: snapshot,
        })
    }

    pub fn finalize_session(&self, caller: &str, request: &FinalizeRequest) -> Result<Ack, ServerError> {
        session::finalize(
            self.sessions.as_ref(),
            &request.session_id,
            caller,
            &request.initiator_identity_key,
            &request.initiator_ephemeral_key,
        )?;
        Ok(Ack::OK)
    }

    pub fn fetch_session(&self, caller: &str, session_id: &str) -> Result<SessionMaterial, ServerError> {
        session::fetch_initiator_material(self.sessions.as_ref(), session_id, caller)
    }

    /// Sessions addressed to `recipient`, optionally only those in `state`.
    pub fn sessions_for(
        &self,
        recipient: &str,
        state: Option<SessionState>,
    ) -> Result<Vec<SessionSummary>, ServerError> {
        Ok(self
            .sessions
            .sessions_for_recipient(recipient, state)?
            .iter()
            .map(SessionSummary::from)
            .collect())
    }
}

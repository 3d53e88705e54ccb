//! Storage traits for the key server.
//!
//! Every method is synchronous and must be safe to call from many threads at
//! once. Implementations: [`memory::MemoryStore`] and [`sqlite::SqliteStore`].

pub mod memory;
pub mod sqlite;

use cinder_crypto::{Bundle, BundleTrust, OneTimePreKeyPublic};
use serde::Serialize;

use crate::error::ServerError;
use crate::session::{Session, SessionState};

/// A user's published bundle, minus one-time prekeys (those live in the
/// [`PrekeyStore`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedBundle {
    pub bundle: Bundle,
    pub trust: BundleTrust,
    pub published_at: i64,
}

/// Per-item outcome of a prekey upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertReport {
    pub inserted: Vec<String>,
    /// Ids that already existed for this user, or repeated within the batch.
    pub rejected: Vec<String>,
}

pub trait BundleStore: Send + Sync {
    /// Insert or replace the bundle for `user_id`.
    fn put_bundle(&self, user_id: &str, record: &PublishedBundle) -> Result<(), ServerError>;

    fn get_bundle(&self, user_id: &str) -> Result<Option<PublishedBundle>, ServerError>;
}

/// One-time prekey storage with at-most-one consumer per prekey.
pub trait PrekeyStore: Send + Sync {
    /// Atomically pick the oldest unconsumed prekey for `user_id` and mark it
    /// consumed. `None` means the user has run out, which is not an error.
    fn reserve_one(&self, user_id: &str) -> Result<Option<OneTimePreKeyPublic>, ServerError>;

    /// Consume a specific prekey. Fails with [`ServerError::PrekeyGone`] if
    /// the id is unknown or was already consumed.
    fn mark_consumed(&self, user_id: &str, key_id: &str) -> Result<(), ServerError>;

    /// Append unconsumed prekeys. Duplicates are skipped and reported, never
    /// abort the batch.
    fn insert_many(
        &self,
        user_id: &str,
        prekeys: &[OneTimePreKeyPublic],
    ) -> Result<InsertReport, ServerError>;

    /// Oldest-first unconsumed prekeys, without consuming them.
    fn list_unconsumed(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<OneTimePreKeyPublic>, ServerError>;

    fn count_unconsumed(&self, user_id: &str) -> Result<usize, ServerError>;
}

pub trait SessionStore: Send + Sync {
    fn insert_session(&self, session: &Session) -> Result<(), ServerError>;

    fn get_session(&self, session_id: &str) -> Result<Option<Session>, ServerError>;

    /// Flip `Initiated` to `Finalized` in one conditional step. Returns
    /// `false` if the session was not in `Initiated` (or does not exist).
    fn finalize_if_initiated(&self, session_id: &str) -> Result<bool, ServerError>;

    /// Sessions addressed to `recipient`, oldest first, optionally filtered
    /// by state.
    fn sessions_for_recipient(
        &self,
        recipient: &str,
        state: Option<SessionState>,
    ) -> Result<Vec<Session>, ServerError>;
}

//! In-memory store. Data is lost on process exit.
//!
//! Prekey reservation never takes the write lock: each prekey carries its own
//! `consumed_at` cell and reservers race on a compare-and-swap under a shared
//! read lock, so two reservers only contend when they target the same row.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use cinder_crypto::OneTimePreKeyPublic;
use parking_lot::{Mutex, RwLock};

use super::{BundleStore, InsertReport, PrekeyStore, PublishedBundle, SessionStore};
use crate::db::timestamp_now;
use crate::error::ServerError;
use crate::session::{Session, SessionState};

const UNCONSUMED: i64 = 0;

struct PrekeySlot {
    key: OneTimePreKeyPublic,
    consumed_at: AtomicI64,
}

impl PrekeySlot {
    fn is_consumed(&self) -> bool {
        self.consumed_at.load(Ordering::Acquire) != UNCONSUMED
    }

    /// Set `consumed_at` if nobody has yet. Exactly one caller sees `true`.
    fn try_consume(&self, now: i64) -> bool {
        self.consumed_at
            .compare_exchange(UNCONSUMED, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[derive(Default)]
pub struct MemoryStore {
    bundles: RwLock<HashMap<String, PublishedBundle>>,
    prekeys: RwLock<HashMap<String, Vec<PrekeySlot>>>,
    sessions: Mutex<HashMap<String, Session>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn consumption_time() -> i64 {
    timestamp_now().max(1)
}

impl BundleStore for MemoryStore {
    fn put_bundle(&self, user_id: &str, record: &PublishedBundle) -> Result<(), ServerError> {
        self.bundles
            .write()
            .insert(user_id.to_owned(), record.clone());
        Ok(())
    }

    fn get_bundle(&self, user_id: &str) -> Result<Option<PublishedBundle>, ServerError> {
        Ok(self.bundles.read().get(user_id).cloned())
    }
}

impl PrekeyStore for MemoryStore {
    fn reserve_one(&self, user_id: &str) -> Result<Option<OneTimePreKeyPublic>, ServerError> {
        let now = consumption_time();
        let prekeys = self.prekeys.read();
        let Some(slots) = prekeys.get(user_id) else {
            return Ok(None);
        };
        // Losing a CAS just means someone else took that slot; move on.
        Ok(slots
            .iter()
            .find(|slot| !slot.is_consumed() && slot.try_consume(now))
            .map(|slot| slot.key.clone()))
    }

    fn mark_consumed(&self, user_id: &str, key_id: &str) -> Result<(), ServerError> {
        let prekeys = self.prekeys.read();
        let slot = prekeys
            .get(user_id)
            .and_then(|slots| slots.iter().find(|slot| slot.key.id == key_id));
        match slot {
            Some(slot) if slot.try_consume(consumption_time()) => Ok(()),
            _ => Err(ServerError::PrekeyGone(key_id.to_owned())),
        }
    }

    fn insert_many(
        &self,
        user_id: &str,
        prekeys: &[OneTimePreKeyPublic],
    ) -> Result<InsertReport, ServerError> {
        let mut all = self.prekeys.write();
        let slots = all.entry(user_id.to_owned()).or_default();
        let mut report = InsertReport::default();

        for key in prekeys {
            if slots.iter().any(|slot| slot.key.id == key.id) {
                report.rejected.push(key.id.clone());
                continue;
            }
            slots.push(PrekeySlot {
                key: key.clone(),
                consumed_at: AtomicI64::new(UNCONSUMED),
            });
            report.inserted.push(key.id.clone());
        }
        Ok(report)
    }

    fn list_unconsumed(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<OneTimePreKeyPublic>, ServerError> {
        let prekeys = self.prekeys.read();
        Ok(prekeys
            .get(user_id)
            .map(|slots| {
                slots
                    .iter()
                    .filter(|slot| !slot.is_consumed())
                    .take(limit)
                    .map(|slot| slot.key.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn count_unconsumed(&self, user_id: &str) -> Result<usize, ServerError> {
        let prekeys = self.prekeys.read();
        Ok(prekeys
            .get(user_id)
            .map_or(0, |slots| slots.iter().filter(|slot| !slot.is_consumed()).count()))
    }
}

impl SessionStore for MemoryStore {
    fn insert_session(&self, session: &Session) -> Result<(), ServerError> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&session.id) {
            return Err(ServerError::Storage(format!(
                "duplicate session id {}",
                session.id
            )));
        }
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    fn get_session(&self, session_id: &str) -> Result<Option<Session>, ServerError> {
        Ok(self.sessions.lock().get(session_id).cloned())
    }

    fn finalize_if_initiated(&self, session_id: &str) -> Result<bool, ServerError> {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(session_id) {
            Some(session) if session.state == SessionState::Initiated => {
                session.state = SessionState::Finalized;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn sessions_for_recipient(
        &self,
        recipient: &str,
        state: Option<SessionState>,
    ) -> Result<Vec<Session>, ServerError> {
        let sessions = self.sessions.lock();
        let mut found: Vec<Session> = sessions
            .values()
            .filter(|s| s.recipient == recipient)
            .filter(|s| state.is_none_or(|wanted| s.state == wanted))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(found)
    }
}

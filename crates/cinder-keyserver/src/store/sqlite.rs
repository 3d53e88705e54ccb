//! `SQLite`-backed store.
//!
//! The connection sits behind a single mutex, so statements are serialized.
//! Every state change that races is still one statement (`UPDATE … RETURNING`
//! or `UPDATE … WHERE <guard>`) so correctness never depends on that mutex.

use std::sync::{Arc, Mutex, MutexGuard};

use cinder_crypto::{Bundle, BundleTrust, OneTimePreKeyPublic};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{BundleStore, InsertReport, PrekeyStore, PublishedBundle, SessionStore};
use crate::db::{open_db, timestamp_now};
use crate::error::ServerError;
use crate::session::{Session, SessionState};

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, ServerError> {
        let conn = open_db(path)?;
        tracing::info!(path = %path, "key server database opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self, ServerError> {
        Self::open(":memory:")
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| {
            tracing::error!(error = %e, "key server db mutex poisoned, recovering");
            e.into_inner()
        })
    }
}

fn trust_str(trust: BundleTrust) -> &'static str {
    match trust {
        BundleTrust::Verified => "verified",
        BundleTrust::Unverified => "unverified",
    }
}

fn conversion_error(column: usize, message: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, message.to_owned().into())
}

fn bundle_from_row(row: &Row<'_>) -> rusqlite::Result<PublishedBundle> {
    let trust = match row.get::<_, String>(4)?.as_str() {
        "verified" => BundleTrust::Verified,
        "unverified" => BundleTrust::Unverified,
        _ => return Err(conversion_error(4, "unknown bundle trust")),
    };
    Ok(PublishedBundle {
        bundle: Bundle {
            identity_key: row.get(0)?,
            signing_public_key: row.get(1)?,
            signed_pre_key: row.get(2)?,
            signed_pre_key_signature: row.get(3)?,
            one_time_pre_keys: Vec::new(),
        },
        trust,
        published_at: row.get(5)?,
    })
}

fn prekey_from_row(row: &Row<'_>) -> rusqlite::Result<OneTimePreKeyPublic> {
    Ok(OneTimePreKeyPublic {
        id: row.get(0)?,
        key: row.get(1)?,
    })
}

const SESSION_COLUMNS: &str = "id, initiator, recipient, conversation_id, one_time_prekey_id, \
     initiator_identity_key, initiator_ephemeral_key, state, created_at";

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let state = SessionState::parse(&row.get::<_, String>(7)?)
        .ok_or_else(|| conversion_error(7, "unknown session state"))?;
    Ok(Session {
        id: row.get(0)?,
        initiator: row.get(1)?,
        recipient: row.get(2)?,
        conversation_id: row.get(3)?,
        one_time_pre_key_id: row.get(4)?,
        initiator_identity_key: row.get(5)?,
        initiator_ephemeral_key: row.get(6)?,
        state,
        created_at: row.get(8)?,
    })
}

impl BundleStore for SqliteStore {
    fn put_bundle(&self, user_id: &str, record: &PublishedBundle) -> Result<(), ServerError> {
        let bundle = &record.bundle;
        self.lock().execute(
            "INSERT OR REPLACE INTO bundles \
             (user_id, identity_key, signing_public_key, signed_pre_key, signed_pre_key_signature, trust, published_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                user_id,
                bundle.identity_key.as_slice(),
                bundle.signing_public_key.as_ref().map(<[u8; 32]>::as_slice),
                bundle.signed_pre_key.as_slice(),
                bundle.signed_pre_key_signature.as_slice(),
                trust_str(record.trust),
                record.published_at,
            ],
        )?;
        Ok(())
    }

    fn get_bundle(&self, user_id: &str) -> Result<Option<PublishedBundle>, ServerError> {
        let record = self
            .lock()
            .query_row(
                "SELECT identity_key, signing_public_key, signed_pre_key, signed_pre_key_signature, trust, published_at \
                 FROM bundles WHERE user_id = ?1",
                params![user_id],
                bundle_from_row,
            )
            .optional()?;
        Ok(record)
    }
}

impl PrekeyStore for SqliteStore {
    fn reserve_one(&self, user_id: &str) -> Result<Option<OneTimePreKeyPublic>, ServerError> {
        let reserved = self
            .lock()
            .query_row(
                "UPDATE one_time_prekeys SET consumed_at = ?1 \
                 WHERE seq = ( \
                     SELECT seq FROM one_time_prekeys \
                     WHERE user_id = ?2 AND consumed_at IS NULL \
                     ORDER BY seq LIMIT 1 \
                 ) AND consumed_at IS NULL \
                 RETURNING key_id, public_key",
                params![timestamp_now(), user_id],
                prekey_from_row,
            )
            .optional()?;
        Ok(reserved)
    }

    fn mark_consumed(&self, user_id: &str, key_id: &str) -> Result<(), ServerError> {
        let changed = self.lock().execute(
            "UPDATE one_time_prekeys SET consumed_at = ?1 \
             WHERE user_id = ?2 AND key_id = ?3 AND consumed_at IS NULL",
            params![timestamp_now(), user_id, key_id],
        )?;
        if changed == 1 {
            Ok(())
        } else {
            Err(ServerError::PrekeyGone(key_id.to_owned()))
        }
    }

    fn insert_many(
        &self,
        user_id: &str,
        prekeys: &[OneTimePreKeyPublic],
    ) -> Result<InsertReport, ServerError> {
        let now = timestamp_now();
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut report = InsertReport::default();
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO one_time_prekeys (user_id, key_id, public_key, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for key in prekeys {
                if stmt.execute(params![user_id, key.id, key.key.as_slice(), now])? == 1 {
                    report.inserted.push(key.id.clone());
                } else {
                    report.rejected.push(key.id.clone());
                }
            }
        }
        tx.commit()?;
        Ok(report)
    }

    fn list_unconsumed(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<OneTimePreKeyPublic>, ServerError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT key_id, public_key FROM one_time_prekeys \
             WHERE user_id = ?1 AND consumed_at IS NULL ORDER BY seq LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![user_id, limit], prekey_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn count_unconsumed(&self, user_id: &str) -> Result<usize, ServerError> {
        let count: i64 = self.lock().query_row(
            "SELECT COUNT(*) FROM one_time_prekeys WHERE user_id = ?1 AND consumed_at IS NULL",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

impl SessionStore for SqliteStore {
    fn insert_session(&self, session: &Session) -> Result<(), ServerError> {
        self.lock().execute(
            "INSERT INTO sessions \
             (id, initiator, recipient, conversation_id, one_time_prekey_id, \
              initiator_identity_key, initiator_ephemeral_key, state, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                session.id,
                session.initiator,
                session.recipient,
                session.conversation_id,
                session.one_time_pre_key_id,
                session.initiator_identity_key.as_slice(),
                session.initiator_ephemeral_key.as_slice(),
                session.state.as_str(),
                session.created_at,
            ],
        )?;
        Ok(())
    }

    fn get_session(&self, session_id: &str) -> Result<Option<Session>, ServerError> {
        let session = self
            .lock()
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                params![session_id],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    fn finalize_if_initiated(&self, session_id: &str) -> Result<bool, ServerError> {
        let changed = self.lock().execute(
            "UPDATE sessions SET state = 'finalized', finalized_at = ?2 \
             WHERE id = ?1 AND state = 'initiated'",
            params![session_id, timestamp_now()],
        )?;
        Ok(changed == 1)
    }

    fn sessions_for_recipient(
        &self,
        recipient: &str,
        state: Option<SessionState>,
    ) -> Result<Vec<Session>, ServerError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE recipient = ?1 AND (?2 IS NULL OR state = ?2) \
             ORDER BY created_at, id"
        ))?;
        let rows = stmt
            .query_map(
                params![recipient, state.map(SessionState::as_str)],
                session_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

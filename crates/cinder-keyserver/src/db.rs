use rusqlite::Connection;

use crate::error::ServerError;

/// Ordered schema steps. `user_version` counts how many have been applied;
/// append new steps, never edit a released one.
const MIGRATIONS: &[&str] = &[SCHEMA_V1];

/// Open (or create) the key server database and apply pending migrations.
pub fn open_db(path: &str) -> Result<Connection, ServerError> {
    let mut conn = Connection::open(path)
        .map_err(|e| ServerError::Storage(format!("failed to open database: {e}")))?;
    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")
        .map_err(|e| ServerError::Storage(format!("failed to configure database: {e}")))?;
    migrate(&mut conn)?;
    Ok(conn)
}

fn migrate(conn: &mut Connection) -> Result<(), ServerError> {
    let applied: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    let applied = usize::try_from(applied).unwrap_or(usize::MAX);
    if applied == MIGRATIONS.len() {
        return Ok(());
    }
    if applied > MIGRATIONS.len() {
        return Err(ServerError::Storage(format!(
            "database schema version {applied} is newer than supported ({})",
            MIGRATIONS.len()
        )));
    }

    // All pending steps commit together or not at all.
    let tx = conn.transaction()?;
    for (step, sql) in MIGRATIONS.iter().enumerate().skip(applied) {
        tx.execute_batch(sql)
            .map_err(|e| ServerError::Storage(format!("migration {} failed: {e}", step + 1)))?;
        tracing::info!(version = step + 1, "applied key server migration");
    }
    tx.pragma_update(None, "user_version", i64::try_from(MIGRATIONS.len()).unwrap_or(i64::MAX))?;
    tx.commit()?;
    Ok(())
}

/// Current UNIX timestamp in milliseconds.
pub fn timestamp_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(i64::MAX)
}

const SCHEMA_V1: &str = r"
CREATE TABLE bundles (
    user_id TEXT PRIMARY KEY,
    identity_key BLOB NOT NULL,
    signing_public_key BLOB,
    signed_pre_key BLOB NOT NULL,
    signed_pre_key_signature BLOB NOT NULL,
    trust TEXT NOT NULL CHECK(trust IN ('verified','unverified')),
    published_at INTEGER NOT NULL
);

-- seq gives reservation its FIFO order; consumed_at is written exactly once.
CREATE TABLE one_time_prekeys (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    key_id TEXT NOT NULL,
    public_key BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    consumed_at INTEGER,
    UNIQUE (user_id, key_id)
);

CREATE INDEX idx_one_time_prekeys_unconsumed
    ON one_time_prekeys(user_id, consumed_at, seq);

CREATE TABLE sessions (
    id TEXT PRIMARY KEY,
    initiator TEXT NOT NULL,
    recipient TEXT NOT NULL,
    conversation_id TEXT NOT NULL,
    one_time_prekey_id TEXT,
    initiator_identity_key BLOB NOT NULL,
    initiator_ephemeral_key BLOB NOT NULL,
    state TEXT NOT NULL CHECK(state IN ('initiated','finalized')),
    created_at INTEGER NOT NULL,
    finalized_at INTEGER
);

CREATE INDEX idx_sessions_recipient
    ON sessions(recipient, created_at);
";

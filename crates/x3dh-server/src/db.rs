use rusqlite::{params, Connection};
use x3dh_proto::CurveId;

use crate::store::StoreError;

/// Store schema version, kept in `PRAGMA user_version`. 0 means the
/// store has never been initialized.
const STORE_SCHEMA_VERSION: i64 = 1;

/// Open the key store at `path`, creating it on first use.
///
/// Two-phase initialization: a fresh store is created with
/// `configured_curve` and that choice is persisted; an existing store
/// ignores the configured value and serves whatever curve it was
/// created with. Returns the connection and the active curve.
pub fn open_store(
    path: &str,
    configured_curve: CurveId,
) -> Result<(Connection, CurveId), StoreError> {
    let conn = Connection::open(path)?;
    init_store(&conn, configured_curve)
        .map(|curve| (conn, curve))
}

fn init_store(conn: &Connection, configured_curve: CurveId) -> Result<CurveId, StoreError> {
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;

    let current: i64 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .unwrap_or(0);

    if current < STORE_SCHEMA_VERSION {
        conn.execute_batch(STORE_SCHEMA)?;
        conn.execute(
            "INSERT INTO config (curve_id) VALUES (?1)",
            params![configured_curve.as_u8()],
        )?;
        conn.pragma_update(None, "user_version", STORE_SCHEMA_VERSION)?;
        tracing::info!(curve = %configured_curve, "created key store");
        return Ok(configured_curve);
    }

    let stored: i64 = conn.query_row("SELECT curve_id FROM config", [], |row| row.get(0))?;
    let curve = u8::try_from(stored)
        .ok()
        .and_then(CurveId::from_u8)
        .ok_or(StoreError::BadStoredCurve(stored))?;
    tracing::info!(curve = %curve, "opened existing key store");
    Ok(curve)
}

#[cfg(test)]
pub fn open_in_memory(curve: CurveId) -> Connection {
    let conn = Connection::open_in_memory().expect("in-memory SQLite");
    init_store(&conn, curve).expect("store init");
    conn
}

const STORE_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS users (
    uid INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL UNIQUE,
    ik BLOB NOT NULL,
    spk BLOB DEFAULT NULL,
    spk_sig BLOB,
    spk_id INTEGER,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS one_time_prekeys (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    uid INTEGER NOT NULL REFERENCES users(uid) ON DELETE CASCADE,
    opk BLOB NOT NULL,
    opk_id INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_one_time_prekeys_uid
    ON one_time_prekeys(uid);

-- Single-row table holding the curve this deployment serves.
CREATE TABLE IF NOT EXISTS config (
    curve_id INTEGER NOT NULL
);
";

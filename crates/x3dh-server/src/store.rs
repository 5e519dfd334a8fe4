//! Key store operations.
//!
//! Every mutating operation runs inside a single transaction on the
//! (mutex-guarded) connection, so a failure at any point rolls the
//! whole operation back. The caller holds the store lock for the full
//! call, which serializes check-then-insert and take-then-delete
//! against concurrent requests.

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use x3dh_proto::{OneTimePreKey, PeerBundle, SignedPreKey};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("user {0} already registered with different keys")]
    UserAlreadyExists(String),

    #[error("user {0} not found")]
    UserNotFound(String),

    #[error("one-time prekey quota: {stored} stored + {incoming} incoming exceeds cap {cap}")]
    OpkQuota {
        stored: u32,
        incoming: u32,
        cap: u32,
    },

    #[error("invalid curve id {0} in config table")]
    BadStoredCurve(i64),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Both variants are wire-level success; `AlreadyRegistered` marks the
/// idempotent re-registration path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Created,
    AlreadyRegistered,
}

pub(crate) fn unix_now() -> i64 {
    i64::try_from(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
    )
    .unwrap_or(i64::MAX)
}

/// Insert a user and its one-time prekeys as one atomic unit.
///
/// Re-registering an existing `user_id` with byte-identical
/// `(ik, spk, spk_sig, spk_id)` is an idempotent no-op so clients can
/// safely retry over a flaky transport; any difference is a conflict.
pub fn register_user(
    conn: &mut Connection,
    user_id: &str,
    ik: &[u8],
    spk: &SignedPreKey,
    opks: &[OneTimePreKey],
    now: i64,
) -> Result<RegisterOutcome, StoreError> {
    let tx = conn.transaction()?;

    let existing = tx
        .query_row(
            "SELECT ik, spk, spk_sig, spk_id FROM users WHERE user_id = ?1",
            params![user_id],
            |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, Option<Vec<u8>>>(1)?,
                    row.get::<_, Option<Vec<u8>>>(2)?,
                    row.get::<_, Option<u32>>(3)?,
                ))
            },
        )
        .optional()?;

    if let Some((cur_ik, cur_spk, cur_sig, cur_spk_id)) = existing {
        let identical = cur_ik == ik
            && cur_spk.as_deref() == Some(&spk.key)
            && cur_sig.as_deref() == Some(&spk.signature)
            && cur_spk_id == Some(spk.id);
        if identical {
            return Ok(RegisterOutcome::AlreadyRegistered);
        }
        return Err(StoreError::UserAlreadyExists(user_id.to_owned()));
    }

    tx.execute(
        "INSERT INTO users (user_id, ik, spk, spk_sig, spk_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![user_id, ik, spk.key, spk.signature, spk.id, now],
    )?;
    let uid = tx.last_insert_rowid();
    insert_opks(&tx, uid, opks)?;

    tx.commit()?;
    Ok(RegisterOutcome::Created)
}

/// Delete a user; its one-time prekeys go with it via cascade.
/// Deleting an unknown user is a no-op success.
pub fn delete_user(conn: &Connection, user_id: &str) -> Result<(), StoreError> {
    conn.execute("DELETE FROM users WHERE user_id = ?1", params![user_id])?;
    Ok(())
}

/// Replace the signed prekey triple as a single update.
pub fn post_signed_prekey(
    conn: &mut Connection,
    user_id: &str,
    spk: &SignedPreKey,
) -> Result<(), StoreError> {
    let tx = conn.transaction()?;
    let uid = lookup_uid(&tx, user_id)?;
    tx.execute(
        "UPDATE users SET spk = ?1, spk_sig = ?2, spk_id = ?3 WHERE uid = ?4",
        params![spk.key, spk.signature, spk.id, uid],
    )?;
    tx.commit()?;
    Ok(())
}

/// Bulk-insert one-time prekeys, enforcing the per-device cap against
/// the already-stored count. All-or-nothing.
pub fn post_one_time_prekeys(
    conn: &mut Connection,
    user_id: &str,
    opks: &[OneTimePreKey],
    cap: u16,
) -> Result<(), StoreError> {
    let tx = conn.transaction()?;
    let uid = lookup_uid(&tx, user_id)?;

    if cap > 0 {
        let stored: u32 = tx.query_row(
            "SELECT COUNT(*) FROM one_time_prekeys WHERE uid = ?1",
            params![uid],
            |row| row.get(0),
        )?;
        let incoming = opks.len() as u32;
        if stored + incoming > u32::from(cap) {
            return Err(StoreError::OpkQuota {
                stored,
                incoming,
                cap: u32::from(cap),
            });
        }
    }

    insert_opks(&tx, uid, opks)?;
    tx.commit()?;
    Ok(())
}

/// Fetch key bundles for the requested peers, consuming at most one
/// one-time prekey per entry.
///
/// The prekey is removed by a single `DELETE ... RETURNING`, inside the
/// same transaction that builds the response, so a given prekey can
/// never appear in two responses. Users without a published signed
/// prekey yield `None` (no usable bundle).
pub fn take_peer_bundles(
    conn: &mut Connection,
    peer_ids: &[String],
) -> Result<Vec<(String, Option<PeerBundle>)>, StoreError> {
    let tx = conn.transaction()?;
    let mut entries = Vec::with_capacity(peer_ids.len());

    for peer_id in peer_ids {
        let user = tx
            .query_row(
                "SELECT uid, ik, spk, spk_sig, spk_id FROM users
                 WHERE user_id = ?1 AND spk IS NOT NULL",
                params![peer_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                        row.get::<_, u32>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((uid, ik, spk_key, spk_sig, spk_id)) = user else {
            entries.push((peer_id.clone(), None));
            continue;
        };

        let opk = tx
            .query_row(
                "DELETE FROM one_time_prekeys
                 WHERE id = (SELECT id FROM one_time_prekeys WHERE uid = ?1 LIMIT 1)
                 RETURNING opk, opk_id",
                params![uid],
                |row| {
                    Ok(OneTimePreKey {
                        key: row.get(0)?,
                        id: row.get(1)?,
                    })
                },
            )
            .optional()?;

        entries.push((
            peer_id.clone(),
            Some(PeerBundle {
                ik,
                spk: SignedPreKey {
                    key: spk_key,
                    signature: spk_sig,
                    id: spk_id,
                },
                opk,
            }),
        ));
    }

    tx.commit()?;
    Ok(entries)
}

/// Ids of all one-time prekeys currently stored for a user. Read-only.
pub fn self_opk_ids(conn: &Connection, user_id: &str) -> Result<Vec<u32>, StoreError> {
    let uid = lookup_uid(conn, user_id)?;
    let mut stmt = conn.prepare("SELECT opk_id FROM one_time_prekeys WHERE uid = ?1")?;
    let ids = stmt
        .query_map(params![uid], |row| row.get(0))?
        .collect::<Result<Vec<u32>, _>>()?;
    Ok(ids)
}

/// Delete users whose registration is older than `ttl_secs`. Used only
/// by the optional TTL eviction policy of ephemeral deployments.
pub fn purge_expired_users(
    conn: &Connection,
    ttl_secs: u64,
    now: i64,
) -> Result<usize, StoreError> {
    let cutoff = now.saturating_sub(i64::try_from(ttl_secs).unwrap_or(i64::MAX));
    let purged = conn.execute(
        "DELETE FROM users WHERE created_at <= ?1",
        params![cutoff],
    )?;
    Ok(purged)
}

fn lookup_uid(conn: &Connection, user_id: &str) -> Result<i64, StoreError> {
    conn.query_row(
        "SELECT uid FROM users WHERE user_id = ?1",
        params![user_id],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| StoreError::UserNotFound(user_id.to_owned()))
}

fn insert_opks(conn: &Connection, uid: i64, opks: &[OneTimePreKey]) -> Result<(), StoreError> {
    let mut stmt =
        conn.prepare("INSERT INTO one_time_prekeys (uid, opk, opk_id) VALUES (?1, ?2, ?3)")?;
    for opk in opks {
        stmt.execute(params![uid, opk.key, opk.id])?;
    }
    Ok(())
}

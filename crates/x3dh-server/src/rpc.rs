//! Request dispatcher: validates the header against server
//! configuration, decodes the body, runs the store operation, and
//! encodes the reply. Every path ends in a definite response — the
//! caller has no other failure signal, so nothing is silently dropped.

use x3dh_proto::{
    CodecError, ErrorCode, Header, MessageType, Request, Response, HEADER_SIZE, PROTOCOL_VERSION,
};

use crate::server_state::ServerState;
use crate::store::{self, RegisterOutcome, StoreError};

/// Handle one decoded-from-transport request and produce the response
/// bytes. `sender` is the authenticated caller identity supplied
/// out-of-band by the frontend.
pub fn handle_request(state: &ServerState, sender: Option<&str>, body: &[u8]) -> Vec<u8> {
    let curve = state.curve;

    let Some(sender) = sender else {
        return fail(
            state,
            ErrorCode::MissingSenderId,
            "From field must be present in the request header".to_owned(),
        );
    };

    let Ok(header) = Header::parse(body) else {
        return fail(
            state,
            ErrorCode::BadSize,
            format!("packet is not even holding a header, size {}", body.len()),
        );
    };

    if header.version != PROTOCOL_VERSION {
        return fail(
            state,
            ErrorCode::BadProtocolVersion,
            format!(
                "server runs X3DH protocol version {PROTOCOL_VERSION}, got {}",
                header.version
            ),
        );
    }

    if header.curve_id != curve.as_u8() {
        return fail(
            state,
            ErrorCode::BadCurve,
            format!("server serves curve {curve}, got curve id {}", header.curve_id),
        );
    }

    let message_type = MessageType::from_u8(header.message_type).filter(|t| t.is_request());
    let Some(message_type) = message_type else {
        return fail(
            state,
            ErrorCode::BadRequest,
            format!("unknown message type {:#04x}", header.message_type),
        );
    };

    let request = match Request::decode(
        message_type,
        curve,
        &body[HEADER_SIZE..],
        state.max_opk_per_device,
    ) {
        Ok(request) => request,
        Err(e) => return fail(state, codec_error_code(&e), e.to_string()),
    };

    tracing::debug!(from = sender, ty = ?message_type, "dispatch");

    match execute(state, sender, request) {
        Ok(response) => response.encode(curve),
        Err(e) => {
            tracing::warn!(from = sender, ty = ?message_type, error = %e, "request failed");
            fail(state, store_error_code(&e), e.to_string())
        }
    }
}

/// Run the store operation for a validated request. The store mutex is
/// held for the whole call, making each mutating operation a critical
/// section; in particular the prekey consumed by a peer-bundle read is
/// deleted before any other request can observe it.
fn execute(state: &ServerState, sender: &str, request: Request) -> Result<Response, StoreError> {
    let mut conn = state.store();
    match request {
        Request::RegisterUser { ik, spk, opks } => {
            let outcome =
                store::register_user(&mut conn, sender, &ik, &spk, &opks, store::unix_now())?;
            match outcome {
                RegisterOutcome::Created => {
                    tracing::info!(user = sender, opks = opks.len(), "registered user");
                }
                RegisterOutcome::AlreadyRegistered => {
                    tracing::info!(user = sender, "re-registration with identical keys, no-op");
                }
            }
            Ok(Response::Ack(MessageType::RegisterUser))
        }
        Request::DeleteUser => {
            store::delete_user(&conn, sender)?;
            tracing::info!(user = sender, "deleted user");
            Ok(Response::Ack(MessageType::DeleteUser))
        }
        Request::PostSignedPreKey(spk) => {
            store::post_signed_prekey(&mut conn, sender, &spk)?;
            Ok(Response::Ack(MessageType::PostSignedPreKey))
        }
        Request::PostOneTimePreKeys(opks) => {
            store::post_one_time_prekeys(&mut conn, sender, &opks, state.max_opk_per_device)?;
            tracing::info!(user = sender, opks = opks.len(), "stored one-time prekeys");
            Ok(Response::Ack(MessageType::PostOneTimePreKeys))
        }
        Request::GetPeerBundles(peers) => {
            let entries = store::take_peer_bundles(&mut conn, &peers)?;
            Ok(Response::PeerBundles(entries))
        }
        Request::GetSelfOpkIds => Ok(Response::SelfOpkIds(store::self_opk_ids(&conn, sender)?)),
    }
}

fn fail(state: &ServerState, code: ErrorCode, message: String) -> Vec<u8> {
    tracing::debug!(code = ?code, message = %message, "error response");
    Response::Error { code, message }.encode(state.curve)
}

fn codec_error_code(e: &CodecError) -> ErrorCode {
    match e {
        CodecError::Truncated { .. } => ErrorCode::BadSize,
        CodecError::OpkQuotaExceeded { .. } => ErrorCode::ResourceLimitReached,
        CodecError::NoPeers
        | CodecError::MalformedPeerList
        | CodecError::MalformedPeerId
        | CodecError::UnknownMessageType(_)
        | CodecError::NotARequest(_)
        | CodecError::UnknownCurve(_)
        | CodecError::UnknownBundleFlag(_) => ErrorCode::BadRequest,
    }
}

fn store_error_code(e: &StoreError) -> ErrorCode {
    match e {
        StoreError::UserAlreadyExists(_) => ErrorCode::UserAlreadyExists,
        StoreError::UserNotFound(_) => ErrorCode::UserNotFound,
        StoreError::OpkQuota { .. } => ErrorCode::ResourceLimitReached,
        StoreError::Sqlite(_) => ErrorCode::DatabaseError,
        StoreError::BadStoredCurve(_) => ErrorCode::ServerFailure,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use std::sync::{Arc, Mutex};
    use x3dh_proto::codec::{decode_peer_bundles, decode_self_opk_ids};
    use x3dh_proto::{CurveId, OneTimePreKey, SignedPreKey};

    const CURVE: CurveId = CurveId::Curve25519;

    fn test_state() -> Arc<ServerState> {
        Arc::new(ServerState {
            db: Arc::new(Mutex::new(db::open_in_memory(CURVE))),
            curve: CURVE,
            max_opk_per_device: 200,
        })
    }

    fn spk(seed: u8) -> SignedPreKey {
        SignedPreKey {
            key: vec![seed; 32],
            signature: vec![seed; 64],
            id: u32::from(seed),
        }
    }

    fn opks(n: u32) -> Vec<OneTimePreKey> {
        (0..n)
            .map(|i| OneTimePreKey {
                key: vec![i as u8; 32],
                id: i,
            })
            .collect()
    }

    fn register(n_opks: u32) -> Vec<u8> {
        Request::RegisterUser {
            ik: vec![0xAA; 32],
            spk: spk(1),
            opks: opks(n_opks),
        }
        .encode(CURVE)
    }

    fn call(state: &ServerState, sender: &str, message: &[u8]) -> Vec<u8> {
        handle_request(state, Some(sender), message)
    }

    fn assert_error(reply: &[u8], code: ErrorCode) {
        assert_eq!(reply[1], MessageType::Error.as_u8(), "expected error reply");
        assert_eq!(reply[3], code.as_u8(), "unexpected error code");
    }

    fn assert_ack(reply: &[u8], echoed: MessageType) {
        assert_eq!(reply, [PROTOCOL_VERSION, echoed.as_u8(), CURVE.as_u8()]);
    }

    #[test]
    fn missing_sender_is_rejected_first() {
        let state = test_state();
        let reply = handle_request(&state, None, &register(0));
        assert_error(&reply, ErrorCode::MissingSenderId);
    }

    #[test]
    fn headerless_packet_is_bad_size() {
        let state = test_state();
        assert_error(&call(&state, "alice", &[PROTOCOL_VERSION]), ErrorCode::BadSize);
    }

    #[test]
    fn wrong_protocol_version() {
        let state = test_state();
        let mut msg = register(0);
        msg[0] = 0x02;
        assert_error(&call(&state, "alice", &msg), ErrorCode::BadProtocolVersion);
    }

    #[test]
    fn curve_mismatch_rejected_for_every_type_without_mutation() {
        let state = test_state();
        for ty in [0x02u8, 0x03, 0x04, 0x05, 0x07, 0x09] {
            let msg = [PROTOCOL_VERSION, ty, CurveId::Curve448.as_u8()];
            assert_error(&call(&state, "alice", &msg), ErrorCode::BadCurve);
        }
        let users: i64 = state
            .store()
            .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
            .unwrap();
        assert_eq!(users, 0);
    }

    #[test]
    fn unknown_and_deprecated_types_are_bad_requests() {
        let state = test_state();
        for ty in [0x00u8, 0x01, 0x06, 0x08, 0x42, 0xff] {
            let msg = [PROTOCOL_VERSION, ty, CURVE.as_u8()];
            assert_error(&call(&state, "alice", &msg), ErrorCode::BadRequest);
        }
    }

    #[test]
    fn truncated_register_is_bad_size() {
        let state = test_state();
        let mut msg = register(2);
        msg.truncate(msg.len() - 3);
        assert_error(&call(&state, "alice", &msg), ErrorCode::BadSize);
    }

    #[test]
    fn register_twice_identical_then_conflicting() {
        let state = test_state();
        assert_ack(
            &call(&state, "alice", &register(2)),
            MessageType::RegisterUser,
        );
        // Identical retry: success, still one user row.
        assert_ack(
            &call(&state, "alice", &register(2)),
            MessageType::RegisterUser,
        );
        let users: i64 = state
            .store()
            .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
            .unwrap();
        assert_eq!(users, 1);

        // Different identity key: conflict.
        let conflicting = Request::RegisterUser {
            ik: vec![0xBB; 32],
            spk: spk(1),
            opks: vec![],
        }
        .encode(CURVE);
        assert_error(&call(&state, "alice", &conflicting), ErrorCode::UserAlreadyExists);
    }

    #[test]
    fn register_quota_via_wire() {
        let state = test_state();
        assert_error(
            &call(&state, "alice", &register(201)),
            ErrorCode::ResourceLimitReached,
        );
    }

    #[test]
    fn post_opks_over_quota_leaves_store_unchanged() {
        let state = test_state();
        call(&state, "alice", &register(195));

        let push = Request::PostOneTimePreKeys(opks(10)).encode(CURVE);
        assert_error(&call(&state, "alice", &push), ErrorCode::ResourceLimitReached);

        let reply = call(&state, "alice", &Request::GetSelfOpkIds.encode(CURVE));
        assert_eq!(reply[1], MessageType::SelfOpkIds.as_u8());
        assert_eq!(decode_self_opk_ids(&reply[3..]).unwrap().len(), 195);
    }

    #[test]
    fn post_spk_for_unknown_user() {
        let state = test_state();
        let msg = Request::PostSignedPreKey(spk(3)).encode(CURVE);
        assert_error(&call(&state, "ghost", &msg), ErrorCode::UserNotFound);
    }

    #[test]
    fn delete_user_cascades_and_is_idempotent() {
        let state = test_state();
        call(&state, "alice", &register(5));

        let del = Request::DeleteUser.encode(CURVE);
        assert_ack(&call(&state, "alice", &del), MessageType::DeleteUser);
        assert_ack(&call(&state, "alice", &del), MessageType::DeleteUser);

        let conn = state.store();
        let users: i64 = conn
            .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
            .unwrap();
        let prekeys: i64 = conn
            .query_row("SELECT COUNT(*) FROM one_time_prekeys", [], |r| r.get(0))
            .unwrap();
        assert_eq!((users, prekeys), (0, 0));
    }

    #[test]
    fn peer_bundle_for_unknown_peer_is_no_bundle_entry() {
        let state = test_state();
        call(&state, "alice", &register(1));

        let msg =
            Request::GetPeerBundles(vec!["alice".into(), "nobody".into()]).encode(CURVE);
        let reply = call(&state, "bob", &msg);
        assert_eq!(reply[1], MessageType::PeerBundles.as_u8());
        let entries = decode_peer_bundles(CURVE, &reply[3..]).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].1.is_some());
        assert_eq!(entries[1], ("nobody".to_owned(), None));
    }

    #[test]
    fn empty_peer_list_is_bad_request() {
        let state = test_state();
        let mut msg = vec![PROTOCOL_VERSION, 0x05, CURVE.as_u8()];
        msg.extend(0u16.to_be_bytes());
        assert_error(&call(&state, "bob", &msg), ErrorCode::BadRequest);
    }

    #[test]
    fn one_time_prekeys_served_at_most_once_under_concurrency() {
        // N prekeys, N+K concurrent takers: exactly N replies carry a
        // distinct prekey, K come back without one, and the store ends
        // empty.
        const N: u32 = 8;
        const K: u32 = 5;

        let state = test_state();
        call(&state, "bob", &register(N));

        let request = Request::GetPeerBundles(vec!["bob".into()]).encode(CURVE);
        let mut handles = Vec::new();
        for _ in 0..(N + K) {
            let state = Arc::clone(&state);
            let request = request.clone();
            handles.push(std::thread::spawn(move || {
                call(&state, "taker", &request)
            }));
        }

        let mut served = Vec::new();
        let mut without_opk = 0;
        for handle in handles {
            let reply = handle.join().expect("taker thread");
            assert_eq!(reply[1], MessageType::PeerBundles.as_u8());
            let entries = decode_peer_bundles(CURVE, &reply[3..]).unwrap();
            let bundle = entries[0].1.as_ref().expect("bundle present");
            match &bundle.opk {
                Some(opk) => served.push(opk.id),
                None => without_opk += 1,
            }
        }

        served.sort_unstable();
        served.dedup();
        assert_eq!(served.len(), N as usize, "every prekey served exactly once");
        assert_eq!(without_opk, K);

        let reply = call(&state, "bob", &Request::GetSelfOpkIds.encode(CURVE));
        assert_eq!(decode_self_opk_ids(&reply[3..]).unwrap().len(), 0);
    }
}

mod db;
mod rpc;
mod server_state;
mod store;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State as AxumState;
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use x3dh_proto::{CurveId, ErrorCode, Response};

use server_state::ServerState;

/// Content type carrying the binary X3DH payload; anything else is
/// rejected in-band.
const X3DH_CONTENT_TYPE: &str = "x3dh/octet-stream";

/// Default one-time-prekey cap. Shall not be lower than the refill
/// threshold plus batch size used by clients.
const DEFAULT_MAX_OPKS: u16 = 200;

/// Command-line arguments for the server daemon.
struct Args {
    db_path: String,
    bind: String,
    curve: CurveId,
    max_opks: u16,
    user_ttl_secs: u64,
}

fn parse_args() -> Args {
    let mut args = std::env::args().skip(1);
    let mut db_path = String::new();
    let mut bind = String::new();
    let mut curve = CurveId::Curve25519;
    let mut max_opks = DEFAULT_MAX_OPKS;
    let mut user_ttl_secs = 0;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--db" => db_path = args.next().unwrap_or_default(),
            "--bind" => bind = args.next().unwrap_or_default(),
            "--curve" => {
                curve = match args.next().unwrap_or_default().as_str() {
                    "c25519" | "" => CurveId::Curve25519,
                    "c448" => CurveId::Curve448,
                    other => {
                        eprintln!("unknown curve {other:?}, expected c25519 or c448");
                        std::process::exit(1);
                    }
                }
            }
            "--max-opks" => {
                max_opks = args
                    .next()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_MAX_OPKS);
            }
            "--user-ttl" => {
                user_ttl_secs = args.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            }
            _ => {}
        }
    }

    if db_path.is_empty() {
        db_path = "x3dh-server.sqlite3".to_owned();
    }
    if bind.is_empty() {
        bind = "127.0.0.1:25519".to_owned();
    }

    Args {
        db_path,
        bind,
        curve,
        max_opks,
        user_ttl_secs,
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    tracing::info!("x3dh-server starting");

    let args = parse_args();

    if let Some(parent) = std::path::Path::new(&args.db_path).parent() {
        std::fs::create_dir_all(parent).expect("failed to create db dir");
    }

    let (conn, curve) = db::open_store(&args.db_path, args.curve).expect("failed to open key store");

    let state = Arc::new(ServerState {
        db: Arc::new(Mutex::new(conn)),
        curve,
        max_opk_per_device: args.max_opks,
    });

    if args.user_ttl_secs > 0 {
        tracing::info!(ttl_secs = args.user_ttl_secs, "user TTL eviction enabled");
        let reaper_state = Arc::clone(&state);
        tokio::spawn(ttl_reaper_loop(reaper_state, args.user_ttl_secs));
    }

    let app = Router::new()
        .route("/", post(handle_post))
        .route("/health", get(|| async { "ok" }))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .expect("failed to bind listen address");

    tracing::info!(addr = %args.bind, curve = %curve, max_opks = args.max_opks, "x3dh-server listening");
    axum::serve(listener, app).await.expect("server error");
}

/// Single protocol endpoint. Always answers HTTP 200 with a binary
/// X3DH payload; protocol failures travel in-band as Error messages.
async fn handle_post(
    AxumState(state): AxumState<Arc<ServerState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    let reply = if content_type == Some(X3DH_CONTENT_TYPE) {
        let sender = headers.get("from").and_then(|v| v.to_str().ok());
        rpc::handle_request(&state, sender, &body)
    } else {
        tracing::debug!(content_type = ?content_type, "bad content type");
        Response::Error {
            code: ErrorCode::BadContentType,
            message: format!("accept {X3DH_CONTENT_TYPE} content type only"),
        }
        .encode(state.curve)
    };

    tracing::debug!(bytes = reply.len(), payload = %hex::encode(&reply), "reply");
    ([(header::CONTENT_TYPE, X3DH_CONTENT_TYPE)], reply)
}

/// Background eviction of users that outlived the configured TTL.
/// Takes the same store lock and delete path as an explicit DeleteUser.
async fn ttl_reaper_loop(state: Arc<ServerState>, ttl_secs: u64) {
    let sweep = Duration::from_secs(ttl_secs.clamp(1, 30));
    let mut interval = tokio::time::interval(sweep);
    loop {
        interval.tick().await;
        let purged = {
            let conn = state.store();
            store::purge_expired_users(&conn, ttl_secs, store::unix_now())
        };
        match purged {
            Ok(0) => {}
            Ok(count) => tracing::info!(count, "purged expired users"),
            Err(e) => tracing::warn!(error = %e, "ttl sweep failed"),
        }
    }
}

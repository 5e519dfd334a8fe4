use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;
use x3dh_proto::CurveId;

/// Central state for the key distribution server.
pub struct ServerState {
    /// The key store. A single connection behind a mutex: every store
    /// operation holds the lock for its whole read-modify-write, which
    /// is what makes check-then-insert and take-then-delete safe under
    /// concurrent requests.
    pub db: Arc<Mutex<Connection>>,
    /// Curve family this deployment serves. Fixed when the store is
    /// created; loaded from the store on every later start.
    pub curve: CurveId,
    /// Maximum one-time prekeys stored per device. 0 disables the cap.
    pub max_opk_per_device: u16,
}

impl ServerState {
    /// Lock the key store, recovering from a poisoned mutex.
    pub fn store(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|e| {
            tracing::error!(error = %e, "key store mutex poisoned — recovering");
            e.into_inner()
        })
    }
}

//! Shared server state (spec.md §3, "Server context").
//!
//! Grounded on the pack's `ServerState`/`Arc<ServerState>` convention
//! (most directly spineldb's `ServerState`): one struct holding every piece
//! of state a connection handler needs, each behind its own lock so
//! unrelated operations (a GET and a PUBLISH) don't contend on the same
//! mutex.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::config::Config;
use crate::pubsub::PubSub;
use crate::replication::ReplicationEngine;
use crate::store::Keyspace;
use crate::types::now_secs;

/// Bookkeeping for the save-interval and save-changes triggers (spec.md
/// §4.C: "save if `saveChanges` writes have accumulated since the last
/// save, checked every `saveSeconds`").
pub struct PersistenceCounters {
    pub changes_since_save: u64,
    pub last_save_secs: u64,
}

impl Default for PersistenceCounters {
    fn default() -> Self {
        Self {
            changes_since_save: 0,
            last_save_secs: now_secs(),
        }
    }
}

pub struct ServerContext {
    pub config: Config,
    pub snapshot_path: std::path::PathBuf,
    pub keyspace: Mutex<Keyspace>,
    pub pubsub: Mutex<PubSub>,
    pub replication: Mutex<ReplicationEngine>,
    pub persistence: Mutex<PersistenceCounters>,
    pub running: AtomicBool,
    pub active_clients: AtomicUsize,
    next_client_id: AtomicU64,
}

impl ServerContext {
    pub fn new(config: Config, snapshot_path: std::path::PathBuf) -> Self {
        Self {
            config,
            snapshot_path,
            keyspace: Mutex::new(Keyspace::create(16)),
            pubsub: Mutex::new(PubSub::new()),
            replication: Mutex::new(ReplicationEngine::new()),
            persistence: Mutex::new(PersistenceCounters::default()),
            running: AtomicBool::new(true),
            active_clients: AtomicUsize::new(0),
            next_client_id: AtomicU64::new(1),
        }
    }

    pub fn next_client_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Records one write command and saves immediately if `saveChanges`
    /// worth of writes have now accumulated.
    pub fn note_write(&self) {
        let mut counters = self.persistence.lock().unwrap();
        counters.changes_since_save += 1;
        if self.config.save_changes != 0 && counters.changes_since_save >= self.config.save_changes {
            drop(counters);
            self.save_now();
        }
    }

    /// Called from the maintenance tick: saves if `saveSeconds` have
    /// elapsed since the last save and at least one write happened.
    /// `saveSeconds == 0` disables this trigger entirely.
    pub fn maybe_timed_save(&self) {
        if self.config.save_seconds == 0 {
            return;
        }
        let due = {
            let counters = self.persistence.lock().unwrap();
            counters.changes_since_save > 0
                && now_secs().saturating_sub(counters.last_save_secs) >= self.config.save_seconds
        };
        if due {
            self.save_now();
        }
    }

    pub fn save_now(&self) {
        let keyspace = self.keyspace.lock().unwrap();
        if let Err(e) = crate::persistence::save(&keyspace, &self.snapshot_path) {
            tracing::error!("snapshot save failed: {e}");
            return;
        }
        drop(keyspace);
        let mut counters = self.persistence.lock().unwrap();
        counters.changes_since_save = 0;
        counters.last_save_secs = now_secs();
    }

    pub fn background_save_now(&self) {
        let keyspace = self.keyspace.lock().unwrap();
        if let Err(e) = crate::persistence::background_save(&keyspace, &self.snapshot_path) {
            tracing::error!("background save failed: {e}");
        }
    }
}

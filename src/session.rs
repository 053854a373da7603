//! Per-client session state (spec.md §3, "Client session").

use std::sync::Arc;

use crate::pubsub::{ClientId, ClientSink};

/// A per-client transaction-and-I/O context. One of these exists per
/// connected client, owned by the worker (thread or reactor slot) that
/// serves it — never shared across workers, per spec.md §5's discipline
/// table ("Owned by one worker at a time; no cross-client sharing").
pub struct ClientSession {
    pub id: ClientId,
    pub peer_addr: String,
    pub in_transaction: bool,
    pub transaction_errors: bool,
    pub queue: Vec<String>,
    /// Set by the REPLCONF handler; the driver inspects this after
    /// dispatch to perform the actual socket hand-off to the replication
    /// engine (dispatch handlers return bytes, they don't own sockets).
    pub pending_replica_port: Option<u16>,
    /// `true` while replaying a line fed by the primary's replication
    /// stream — the dispatcher's "silent session" mode (design-notes §9),
    /// replacing the source's sentinel `fd == -1` convention.
    pub silent: bool,
    /// Created alongside the session at connection time, so SUBSCRIBE never
    /// has to reach back into driver-owned socket state to build one.
    pub pubsub_sink: Arc<dyn ClientSink>,
    /// Set by the REPLICAOF handler; the driver spawns (or cancels) the
    /// replica-side worker thread after seeing this.
    pub pending_replicaof: Option<ReplicaofAction>,
}

#[derive(Debug, Clone)]
pub enum ReplicaofAction {
    Connect(String, u16),
    NoOne,
}

struct NullSink;
impl ClientSink for NullSink {
    fn push(&self, _bytes: &[u8]) {}
}

impl ClientSession {
    pub fn new(id: ClientId, peer_addr: String, sink: Arc<dyn ClientSink>) -> Self {
        Self {
            id,
            peer_addr,
            in_transaction: false,
            transaction_errors: false,
            queue: Vec::new(),
            pending_replica_port: None,
            silent: false,
            pubsub_sink: sink,
            pending_replicaof: None,
        }
    }

    /// A session used only to replay lines fed by a primary's replication
    /// stream; it never itself has subscribers, so a no-op sink is enough.
    pub fn silent_replay(id: ClientId) -> Self {
        let mut s = Self::new(id, "replication-link".to_string(), Arc::new(NullSink));
        s.silent = true;
        s
    }
}

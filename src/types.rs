//! Shared value and role types (spec.md §3, component A).

use std::time::{SystemTime, UNIX_EPOCH};

/// The type tag carried by every keyspace entry. Only `String` is ever
/// materialized; the rest are reserved per spec.md §3 and Non-goals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    String,
    List,
    Set,
    Int,
    Float,
    Bool,
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

/// Current wall-clock time in whole seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs()
}

/// A typed value object (spec.md §4.A). `size` is recorded once at creation
/// time from the payload's length and only adjusted when the payload is
/// replaced wholesale (never mutated in place).
#[derive(Debug, Clone)]
pub struct Value {
    pub value_type: ValueType,
    pub payload: Vec<u8>,
    pub size: usize,
    /// 0 means "no expiry".
    pub expiry_ms: u64,
    pub last_access_ms: u64,
}

impl Value {
    pub fn new_string(payload: Vec<u8>, expiry_ms: u64) -> Self {
        let size = payload.len();
        Self {
            value_type: ValueType::String,
            payload,
            size,
            expiry_ms,
            last_access_ms: now_ms(),
        }
    }

    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expiry_ms != 0 && self.expiry_ms < now
    }

    pub fn touch(&mut self) {
        self.last_access_ms = now_ms();
    }

    pub fn as_str_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Primary/replica role (spec.md §3, "Replication state").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Replica,
}

/// Link state, meaningful only when `Role::Replica`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    None,
    Connecting,
    Sync,
    Connected,
}

impl LinkState {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkState::None => "none",
            LinkState::Connecting => "connecting",
            LinkState::Sync => "sync",
            LinkState::Connected => "connected",
        }
    }
}

/// Generates the 40-character lowercase alphanumeric replication id
/// spec.md §3 requires, using `rand` (the pack's idiomatic choice for this,
/// see spineldb's `getrandom`-backed replid and kimberlite's `rand`
/// workspace dependency).
pub fn generate_replid() -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..40)
        .map(|_| {
            let idx = rng.gen_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

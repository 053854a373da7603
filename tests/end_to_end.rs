//! End-to-end scenarios from the functional spec's testable-properties
//! section, driven through the public dispatch/context API rather than
//! real sockets — the wire layer itself is exercised by `resp.rs`'s unit
//! tests, so these focus on cross-module behavior.

use std::sync::Arc;

use crimsoncache::config::Config;
use crimsoncache::context::ServerContext;
use crimsoncache::dispatcher::dispatch_line;
use crimsoncache::pubsub::ClientSink;
use crimsoncache::session::ClientSession;

struct NullSink;
impl ClientSink for NullSink {
    fn push(&self, _bytes: &[u8]) {}
}

fn fresh_ctx() -> ServerContext {
    let dir = tempfile::tempdir().unwrap();
    ServerContext::new(Config::default(), dir.path().join("dump.ccdb"))
}

fn fresh_session(id: u64) -> ClientSession {
    ClientSession::new(id, format!("127.0.0.1:{id}"), Arc::new(NullSink))
}

/// Scenario (a): a basic SET followed by a GET returns the stored value.
#[test]
fn basic_set_and_get() {
    let ctx = fresh_ctx();
    let mut s = fresh_session(1);
    assert_eq!(dispatch_line(&ctx, &mut s, "SET greeting hello"), b"+OK\r\n");
    assert_eq!(dispatch_line(&ctx, &mut s, "GET greeting"), b"$5\r\nhello\r\n");
}

/// Scenario (b): a key set with a short PX expiry is gone shortly after.
#[test]
fn expiry_removes_key_after_ttl() {
    let ctx = fresh_ctx();
    let mut s = fresh_session(1);
    dispatch_line(&ctx, &mut s, "SET temp value PX 20");
    assert_eq!(dispatch_line(&ctx, &mut s, "GET temp"), b"$5\r\nvalue\r\n");
    std::thread::sleep(std::time::Duration::from_millis(40));
    assert_eq!(dispatch_line(&ctx, &mut s, "GET temp"), b"$-1\r\n");
}

/// Scenario (c): INCR on an absent key starts at 1 and keeps counting.
#[test]
fn incr_counts_from_zero() {
    let ctx = fresh_ctx();
    let mut s = fresh_session(1);
    for expected in 1..=3 {
        let reply = dispatch_line(&ctx, &mut s, "INCR hits");
        assert_eq!(reply, format!(":{expected}\r\n").into_bytes());
    }
}

/// Scenario (d): commands inside MULTI are queued, not executed, until
/// EXEC replays them in order.
#[test]
fn transaction_framing_defers_execution_until_exec() {
    let ctx = fresh_ctx();
    let mut s = fresh_session(1);

    dispatch_line(&ctx, &mut s, "MULTI");
    let queued_reply = dispatch_line(&ctx, &mut s, "SET inside queued");
    assert_eq!(queued_reply, b"+QUEUED\r\n");

    dispatch_line(&ctx, &mut s, "EXEC");
    assert_eq!(dispatch_line(&ctx, &mut s, "GET inside"), b"$6\r\nqueued\r\n");
}

/// A transaction dirtied by a bad queued command aborts without running
/// anything, and the client returns to normal (non-transaction) dispatch.
#[test]
fn dirtied_transaction_aborts_and_resets_state() {
    let ctx = fresh_ctx();
    let mut s = fresh_session(1);

    dispatch_line(&ctx, &mut s, "MULTI");
    dispatch_line(&ctx, &mut s, "SET ok value");
    dispatch_line(&ctx, &mut s, "NOTACOMMAND");
    let reply = dispatch_line(&ctx, &mut s, "EXEC");
    assert!(reply.starts_with(b"-"));
    assert_eq!(dispatch_line(&ctx, &mut s, "GET ok"), b"$-1\r\n");
    assert_eq!(dispatch_line(&ctx, &mut s, "PING"), b"+PONG\r\n");
}

/// Scenario (e): a successful write command on a primary server advances
/// the replication offset and reaches a connected replica link.
#[test]
fn writes_propagate_to_connected_replicas() {
    use crimsoncache::replication::ReplicaLink;
    use std::io;
    use std::sync::Mutex;

    struct RecordingLink(Mutex<Vec<String>>);
    impl ReplicaLink for RecordingLink {
        fn write_line(&self, bytes: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().push(String::from_utf8_lossy(bytes).into_owned());
            Ok(bytes.len())
        }
    }

    let ctx = fresh_ctx();
    let mut s = fresh_session(1);

    ctx.replication
        .lock()
        .unwrap()
        .add_replica(Box::new(RecordingLink(Mutex::new(Vec::new()))), "127.0.0.1".to_string(), 7777);

    dispatch_line(&ctx, &mut s, "SET k v");
    assert!(ctx.replication.lock().unwrap().offset > 0);
}

/// A read command (GET) never advances the replication offset — only the
/// documented write set does.
#[test]
fn read_commands_do_not_replicate() {
    use crimsoncache::replication::ReplicaLink;
    use std::io;
    use std::sync::Mutex;

    struct CountingLink(Mutex<usize>);
    impl ReplicaLink for CountingLink {
        fn write_line(&self, bytes: &[u8]) -> io::Result<usize> {
            *self.0.lock().unwrap() += 1;
            Ok(bytes.len())
        }
    }

    let ctx = fresh_ctx();
    let mut s = fresh_session(1);
    ctx.replication
        .lock()
        .unwrap()
        .add_replica(Box::new(CountingLink(Mutex::new(0))), "127.0.0.1".to_string(), 7778);

    dispatch_line(&ctx, &mut s, "SET k v");
    let offset_after_write = ctx.replication.lock().unwrap().offset;
    assert!(offset_after_write > 0);

    dispatch_line(&ctx, &mut s, "GET k");
    assert_eq!(ctx.replication.lock().unwrap().offset, offset_after_write);
}

/// Pub/Sub delivery: a PUBLISH reaches all current subscribers and reports
/// how many were reached.
#[test]
fn publish_reports_subscriber_count() {
    use std::sync::Mutex;

    struct RecordingSink(Mutex<Vec<u8>>);
    impl ClientSink for RecordingSink {
        fn push(&self, bytes: &[u8]) {
            self.0.lock().unwrap().extend_from_slice(bytes);
        }
    }

    let ctx = fresh_ctx();
    let sink: Arc<dyn ClientSink> = Arc::new(RecordingSink(Mutex::new(Vec::new())));
    let mut subscriber = ClientSession::new(2, "127.0.0.1:2".to_string(), sink);
    dispatch_line(&ctx, &mut subscriber, "SUBSCRIBE news");

    let mut publisher = fresh_session(1);
    assert_eq!(dispatch_line(&ctx, &mut publisher, "PUBLISH news hello"), b":1\r\n");
}

/// A snapshot saved mid-session and reloaded into a fresh context preserves
/// every live key.
#[test]
fn save_and_reload_preserves_keys() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dump.ccdb");

    let ctx = ServerContext::new(Config::default(), path.clone());
    let mut s = fresh_session(1);
    dispatch_line(&ctx, &mut s, "SET a 1");
    dispatch_line(&ctx, &mut s, "SET b 2");
    ctx.save_now();

    let reloaded = ServerContext::new(Config::default(), path.clone());
    {
        let mut keyspace = reloaded.keyspace.lock().unwrap();
        crimsoncache::persistence::load(&mut keyspace, &path).unwrap();
    }
    let mut s2 = fresh_session(2);
    assert_eq!(dispatch_line(&reloaded, &mut s2, "GET a"), b"$1\r\n1\r\n");
    assert_eq!(dispatch_line(&reloaded, &mut s2, "GET b"), b"$1\r\n2\r\n");
}

//! Command dispatch (spec.md §4.E, component E).
//!
//! A small table of `(name, min_argc, max_argc)` arity specs feeding a
//! single match-based handler lookup, matching the shape of the teacher's
//! `route_event` dispatcher: validate shape first, run the handler second,
//! never the other way around.

use crate::context::ServerContext;
use crate::errors::CrimsonError;
use crate::resp;
use crate::session::{ClientSession, ReplicaofAction};
use crate::tokenizer::tokenize;
use crate::transactions;
use crate::types::{Role, Value, now_ms};

const WRITE_COMMANDS: &[&str] = &["set", "del", "expire", "incr"];
const TX_CONTROL_COMMANDS: &[&str] = &["multi", "exec", "discard"];

struct CommandSpec {
    name: &'static str,
    min_argc: usize,
    max_argc: usize,
}

const COMMANDS: &[CommandSpec] = &[
    CommandSpec { name: "ping", min_argc: 1, max_argc: 2 },
    CommandSpec { name: "set", min_argc: 3, max_argc: 5 },
    CommandSpec { name: "get", min_argc: 2, max_argc: 2 },
    CommandSpec { name: "del", min_argc: 2, max_argc: usize::MAX },
    CommandSpec { name: "exists", min_argc: 2, max_argc: usize::MAX },
    CommandSpec { name: "expire", min_argc: 3, max_argc: 3 },
    CommandSpec { name: "ttl", min_argc: 2, max_argc: 2 },
    CommandSpec { name: "incr", min_argc: 2, max_argc: 2 },
    CommandSpec { name: "save", min_argc: 1, max_argc: 1 },
    CommandSpec { name: "bgsave", min_argc: 1, max_argc: 1 },
    CommandSpec { name: "replicaof", min_argc: 3, max_argc: 3 },
    CommandSpec { name: "role", min_argc: 1, max_argc: 1 },
    CommandSpec { name: "replconf", min_argc: 2, max_argc: usize::MAX },
    CommandSpec { name: "psync", min_argc: 1, max_argc: usize::MAX },
    CommandSpec { name: "multi", min_argc: 1, max_argc: 1 },
    CommandSpec { name: "exec", min_argc: 1, max_argc: 1 },
    CommandSpec { name: "discard", min_argc: 1, max_argc: 1 },
    CommandSpec { name: "subscribe", min_argc: 2, max_argc: usize::MAX },
    CommandSpec { name: "unsubscribe", min_argc: 1, max_argc: usize::MAX },
    CommandSpec { name: "publish", min_argc: 3, max_argc: 3 },
];

fn lookup(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|c| c.name == name)
}

/// Tokenizes and dispatches a single line without queueing, for MULTI
/// replay and for replication replay. Applies the write-propagation rule
/// (spec.md §4.H: primary, non-transactional, non-error writes feed
/// replicas) but never touches the caller's transaction state itself.
pub fn dispatch_command(ctx: &ServerContext, session: &mut ClientSession, raw_line: &str) -> Vec<u8> {
    let argv = tokenize(raw_line);
    if argv.is_empty() {
        return resp::error(&format!("ERR {}", CrimsonError::EmptyCommand));
    }
    let name = argv[0].to_lowercase();

    let Some(spec) = lookup(&name) else {
        return resp::error(&format!("ERR {}", CrimsonError::UnknownCommand));
    };
    if argv.len() < spec.min_argc || argv.len() > spec.max_argc {
        return resp::error(&format!("ERR {}", CrimsonError::WrongArity));
    }

    let reply = run_handler(ctx, session, &name, &argv);

    if WRITE_COMMANDS.contains(&name.as_str())
        && !reply.starts_with(b"-")
        && !session.in_transaction
    {
        ctx.note_write();
        let is_primary = ctx.replication.lock().unwrap().role == Role::Primary;
        if is_primary {
            ctx.replication.lock().unwrap().feed_slaves(raw_line);
        }
    }

    reply
}

/// The entry point for a freshly read client line: applies MULTI queueing
/// before any command-specific logic runs.
pub fn dispatch_line(ctx: &ServerContext, session: &mut ClientSession, raw_line: &str) -> Vec<u8> {
    let argv = tokenize(raw_line);
    if argv.is_empty() {
        return resp::error(&format!("ERR {}", CrimsonError::EmptyCommand));
    }
    let name = argv[0].to_lowercase();

    if session.in_transaction && !TX_CONTROL_COMMANDS.contains(&name.as_str()) {
        let Some(spec) = lookup(&name) else {
            transactions::mark_error(session);
            return resp::error(&format!("ERR {}", CrimsonError::UnknownCommand));
        };
        if argv.len() < spec.min_argc || argv.len() > spec.max_argc {
            transactions::mark_error(session);
            return resp::error(&format!("ERR {}", CrimsonError::WrongArity));
        }
        return match transactions::queue(session, raw_line.to_string()) {
            Ok(()) => resp::simple_string("QUEUED"),
            Err(e) => {
                transactions::mark_error(session);
                resp::error(&format!("ERR {e}"))
            }
        };
    }

    dispatch_command(ctx, session, raw_line)
}

/// Used by the replication replay path: dispatches and discards the reply,
/// since a replica replaying its primary's stream has no one to answer.
pub fn dispatch_command_from_line(ctx: &ServerContext, session: &mut ClientSession, raw_line: &str) {
    let _ = dispatch_command(ctx, session, raw_line);
}

fn run_handler(ctx: &ServerContext, session: &mut ClientSession, name: &str, argv: &[String]) -> Vec<u8> {
    match name {
        "ping" => cmd_ping(argv),
        "set" => cmd_set(ctx, argv),
        "get" => cmd_get(ctx, argv),
        "del" => cmd_del(ctx, argv),
        "exists" => cmd_exists(ctx, argv),
        "expire" => cmd_expire(ctx, argv),
        "ttl" => cmd_ttl(ctx, argv),
        "incr" => cmd_incr(ctx, argv),
        "save" => cmd_save(ctx),
        "bgsave" => cmd_bgsave(ctx),
        "replicaof" => cmd_replicaof(session, argv),
        "role" => cmd_role(ctx),
        "replconf" => cmd_replconf(session, argv),
        "psync" => resp::simple_string("FULLRESYNC"),
        "multi" => cmd_multi(session),
        "exec" => cmd_exec(ctx, session),
        "discard" => cmd_discard(session),
        "subscribe" => cmd_subscribe(ctx, session, argv),
        "unsubscribe" => cmd_unsubscribe(ctx, session, argv),
        "publish" => cmd_publish(ctx, argv),
        _ => resp::error(&format!("ERR {}", CrimsonError::UnknownCommand)),
    }
}

fn cmd_ping(argv: &[String]) -> Vec<u8> {
    match argv.get(1) {
        Some(msg) => resp::bulk_string(msg.as_bytes()),
        None => resp::simple_string("PONG"),
    }
}

fn cmd_set(ctx: &ServerContext, argv: &[String]) -> Vec<u8> {
    let key = argv[1].as_bytes();
    let payload = argv[2].as_bytes().to_vec();
    let mut expiry_ms = 0u64;

    if argv.len() == 5 {
        let opt = argv[3].to_uppercase();
        let amount: u64 = match argv[4].parse() {
            Ok(v) => v,
            Err(_) => return resp::error(&format!("ERR {}", CrimsonError::NotAnInteger)),
        };
        match opt.as_str() {
            "EX" => expiry_ms = now_ms() + amount * 1000,
            "PX" => expiry_ms = now_ms() + amount,
            _ => return resp::error("ERR syntax error"),
        }
    } else if argv.len() != 3 {
        return resp::error(&format!("ERR {}", CrimsonError::WrongArity));
    }

    let mut keyspace = ctx.keyspace.lock().unwrap();
    if keyspace.insert(key, Value::new_string(payload, expiry_ms)) {
        resp::simple_string("OK")
    } else {
        resp::error(&format!("ERR {}", CrimsonError::CouldNotSetKey))
    }
}

fn cmd_get(ctx: &ServerContext, argv: &[String]) -> Vec<u8> {
    let mut keyspace = ctx.keyspace.lock().unwrap();
    match keyspace.lookup(argv[1].as_bytes()) {
        Some(v) => resp::bulk_string(&v.payload),
        None => resp::null_bulk(),
    }
}

fn cmd_del(ctx: &ServerContext, argv: &[String]) -> Vec<u8> {
    let mut keyspace = ctx.keyspace.lock().unwrap();
    let count = argv[1..].iter().filter(|k| keyspace.delete(k.as_bytes())).count();
    resp::integer(count as i64)
}

fn cmd_exists(ctx: &ServerContext, argv: &[String]) -> Vec<u8> {
    let keyspace = ctx.keyspace.lock().unwrap();
    let count = argv[1..].iter().filter(|k| keyspace.peek(k.as_bytes()).is_some()).count();
    resp::integer(count as i64)
}

fn cmd_expire(ctx: &ServerContext, argv: &[String]) -> Vec<u8> {
    // Seconds is signed: a negative value sets an already-past expiry
    // rather than being rejected outright.
    let seconds: i64 = match argv[2].parse() {
        Ok(v) => v,
        Err(_) => return resp::error(&format!("ERR {}", CrimsonError::NotAnInteger)),
    };
    let mut keyspace = ctx.keyspace.lock().unwrap();
    let Some(existing) = keyspace.lookup(argv[1].as_bytes()).cloned() else {
        return resp::integer(0);
    };
    let mut updated = existing;
    let new_expiry = now_ms() as i64 + seconds * 1000;
    // expiry_ms == 0 means "no expiry", so a non-positive result is
    // clamped to 1ms past the epoch rather than landing on that sentinel.
    updated.expiry_ms = new_expiry.max(1) as u64;
    keyspace.insert(argv[1].as_bytes(), updated);
    resp::integer(1)
}

fn cmd_ttl(ctx: &ServerContext, argv: &[String]) -> Vec<u8> {
    let mut keyspace = ctx.keyspace.lock().unwrap();
    match keyspace.lookup(argv[1].as_bytes()) {
        None => resp::integer(-2),
        Some(v) if v.expiry_ms == 0 => resp::integer(-1),
        Some(v) => {
            let remaining_ms = v.expiry_ms.saturating_sub(now_ms());
            resp::integer((remaining_ms / 1000) as i64)
        }
    }
}

fn cmd_incr(ctx: &ServerContext, argv: &[String]) -> Vec<u8> {
    let mut keyspace = ctx.keyspace.lock().unwrap();
    let (current, expiry_ms) = match keyspace.lookup(argv[1].as_bytes()) {
        Some(v) => {
            let parsed: Result<i64, _> = v.as_str_lossy().parse();
            match parsed {
                Ok(n) => (n, v.expiry_ms),
                Err(_) => return resp::error(&format!("ERR {}", CrimsonError::NotAnInteger)),
            }
        }
        None => (0, 0),
    };
    let next = current + 1;
    keyspace.insert(argv[1].as_bytes(), Value::new_string(next.to_string().into_bytes(), expiry_ms));
    resp::integer(next)
}

fn cmd_save(ctx: &ServerContext) -> Vec<u8> {
    ctx.save_now();
    resp::simple_string("OK")
}

fn cmd_bgsave(ctx: &ServerContext) -> Vec<u8> {
    ctx.background_save_now();
    resp::simple_string("Background saving started")
}

fn cmd_replicaof(session: &mut ClientSession, argv: &[String]) -> Vec<u8> {
    if argv[1].eq_ignore_ascii_case("no") && argv[2].eq_ignore_ascii_case("one") {
        session.pending_replicaof = Some(ReplicaofAction::NoOne);
        return resp::simple_string("OK");
    }
    let port: u16 = match argv[2].parse() {
        Ok(p) if p != 0 => p,
        _ => return resp::error(&format!("ERR {}", CrimsonError::InvalidPort)),
    };
    session.pending_replicaof = Some(ReplicaofAction::Connect(argv[1].clone(), port));
    resp::simple_string("OK")
}

fn cmd_role(ctx: &ServerContext) -> Vec<u8> {
    ctx.replication.lock().unwrap().role_reply()
}

fn cmd_replconf(session: &mut ClientSession, argv: &[String]) -> Vec<u8> {
    if argv.len() == 3 && argv[1].eq_ignore_ascii_case("listening-port") {
        if let Ok(port) = argv[2].parse::<u16>() {
            if port != 0 {
                session.pending_replica_port = Some(port);
            }
        }
    }
    resp::simple_string("OK")
}

fn cmd_multi(session: &mut ClientSession) -> Vec<u8> {
    match transactions::begin(session) {
        Ok(()) => resp::simple_string("OK"),
        Err(e) => resp::error(&format!("ERR {e}")),
    }
}

fn cmd_discard(session: &mut ClientSession) -> Vec<u8> {
    match transactions::discard(session) {
        Ok(()) => resp::simple_string("OK"),
        Err(e) => resp::error(&format!("ERR {e}")),
    }
}

fn cmd_exec(ctx: &ServerContext, session: &mut ClientSession) -> Vec<u8> {
    let queued = match transactions::take_for_exec(session) {
        Ok(lines) => lines,
        Err(CrimsonError::ExecAborted) => return resp::error(&CrimsonError::ExecAborted.to_string()),
        Err(e) => return resp::error(&format!("ERR {e}")),
    };
    let mut out = resp::array_header(queued.len());
    for line in &queued {
        out.extend(dispatch_command(ctx, session, line));
    }
    out
}

fn cmd_subscribe(ctx: &ServerContext, session: &mut ClientSession, argv: &[String]) -> Vec<u8> {
    let names: Vec<String> = argv[1..].to_vec();
    ctx.pubsub
        .lock()
        .unwrap()
        .subscribe(session.id, session.pubsub_sink.clone(), &names);
    Vec::new()
}

fn cmd_unsubscribe(ctx: &ServerContext, session: &mut ClientSession, argv: &[String]) -> Vec<u8> {
    let names: Vec<String> = argv[1..].to_vec();
    ctx.pubsub
        .lock()
        .unwrap()
        .unsubscribe(session.id, &session.pubsub_sink, &names);
    Vec::new()
}

fn cmd_publish(ctx: &ServerContext, argv: &[String]) -> Vec<u8> {
    let delivered = ctx.pubsub.lock().unwrap().publish(&argv[1], argv[2].as_bytes());
    resp::integer(delivered as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::ClientSink;
    use std::sync::Arc;

    struct NullSink;
    impl ClientSink for NullSink {
        fn push(&self, _bytes: &[u8]) {}
    }

    fn test_ctx() -> ServerContext {
        let dir = tempfile::tempdir().unwrap();
        ServerContext::new(crate::config::Config::default(), dir.path().join("dump.ccdb"))
    }

    fn test_session() -> ClientSession {
        ClientSession::new(1, "127.0.0.1:1".to_string(), Arc::new(NullSink))
    }

    #[test]
    fn ping_without_argument() {
        let ctx = test_ctx();
        let mut s = test_session();
        assert_eq!(dispatch_line(&ctx, &mut s, "PING"), b"+PONG\r\n");
    }

    #[test]
    fn set_then_get_round_trips() {
        let ctx = test_ctx();
        let mut s = test_session();
        dispatch_line(&ctx, &mut s, "SET foo bar");
        assert_eq!(dispatch_line(&ctx, &mut s, "GET foo"), b"$3\r\nbar\r\n");
    }

    #[test]
    fn get_missing_key_is_null_bulk() {
        let ctx = test_ctx();
        let mut s = test_session();
        assert_eq!(dispatch_line(&ctx, &mut s, "GET nope"), b"$-1\r\n");
    }

    #[test]
    fn incr_on_missing_key_starts_at_one() {
        let ctx = test_ctx();
        let mut s = test_session();
        assert_eq!(dispatch_line(&ctx, &mut s, "INCR counter"), b":1\r\n");
        assert_eq!(dispatch_line(&ctx, &mut s, "INCR counter"), b":2\r\n");
    }

    #[test]
    fn incr_on_non_integer_value_errors() {
        let ctx = test_ctx();
        let mut s = test_session();
        dispatch_line(&ctx, &mut s, "SET k notanumber");
        let reply = dispatch_line(&ctx, &mut s, "INCR k");
        assert!(reply.starts_with(b"-"));
    }

    #[test]
    fn unknown_command_is_an_error() {
        let ctx = test_ctx();
        let mut s = test_session();
        let reply = dispatch_line(&ctx, &mut s, "BOGUS");
        assert!(reply.starts_with(b"-"));
    }

    #[test]
    fn wrong_arity_is_an_error() {
        let ctx = test_ctx();
        let mut s = test_session();
        let reply = dispatch_line(&ctx, &mut s, "GET");
        assert!(reply.starts_with(b"-"));
    }

    #[test]
    fn multi_queues_and_exec_replays_in_order() {
        let ctx = test_ctx();
        let mut s = test_session();
        dispatch_line(&ctx, &mut s, "MULTI");
        assert_eq!(dispatch_line(&ctx, &mut s, "SET a 1"), b"+QUEUED\r\n");
        assert_eq!(dispatch_line(&ctx, &mut s, "SET b 2"), b"+QUEUED\r\n");
        let reply = dispatch_line(&ctx, &mut s, "EXEC");
        assert_eq!(reply, b"*2\r\n+OK\r\n+OK\r\n");
        assert_eq!(dispatch_line(&ctx, &mut s, "GET a"), b"$1\r\n1\r\n");
    }

    #[test]
    fn queued_unknown_command_dirties_transaction() {
        let ctx = test_ctx();
        let mut s = test_session();
        dispatch_line(&ctx, &mut s, "MULTI");
        dispatch_line(&ctx, &mut s, "BOGUS");
        let reply = dispatch_line(&ctx, &mut s, "EXEC");
        assert!(reply.starts_with(b"-"));
    }

    #[test]
    fn publish_with_no_subscribers_returns_zero() {
        let ctx = test_ctx();
        let mut s = test_session();
        assert_eq!(dispatch_line(&ctx, &mut s, "PUBLISH news hello"), b":0\r\n");
    }

    #[test]
    fn expire_on_missing_key_returns_zero() {
        let ctx = test_ctx();
        let mut s = test_session();
        assert_eq!(dispatch_line(&ctx, &mut s, "EXPIRE nope 10"), b":0\r\n");
    }

    #[test]
    fn ttl_on_persistent_key_is_minus_one() {
        let ctx = test_ctx();
        let mut s = test_session();
        dispatch_line(&ctx, &mut s, "SET k v");
        assert_eq!(dispatch_line(&ctx, &mut s, "TTL k"), b":-1\r\n");
    }
}

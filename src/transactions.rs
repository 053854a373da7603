//! MULTI/EXEC/DISCARD transaction framing (spec.md §4.F, component F).
//!
//! This is deliberately a handful of free functions operating on
//! `ClientSession` rather than a struct of its own — the state that matters
//! (`in_transaction`, `transaction_errors`, `queue`) already lives on the
//! session, per spec.md §3's "client session" data model, and component F
//! is just the rules for mutating it.

use crate::errors::CrimsonError;
use crate::session::ClientSession;

/// Enters MULTI. Nesting is rejected outright (design-notes §9 does not
/// flag this as an open question — unlike most real command servers there
/// is no silent no-op here).
pub fn begin(session: &mut ClientSession) -> Result<(), CrimsonError> {
    if session.in_transaction {
        return Err(CrimsonError::NestedMulti);
    }
    session.in_transaction = true;
    session.transaction_errors = false;
    session.queue.clear();
    Ok(())
}

pub fn discard(session: &mut ClientSession) -> Result<(), CrimsonError> {
    if !session.in_transaction {
        return Err(CrimsonError::DiscardWithoutMulti);
    }
    session.in_transaction = false;
    session.transaction_errors = false;
    session.queue.clear();
    Ok(())
}

/// Appends a raw line to the queue. Queuing itself cannot fail today (there
/// is no queue depth limit in spec.md), but the `Result` return mirrors the
/// source's `QUEUED`/error split so a future bound can be added without
/// changing every call site.
pub fn queue(session: &mut ClientSession, raw_line: String) -> Result<(), CrimsonError> {
    if !session.in_transaction {
        return Err(CrimsonError::ExecWithoutMulti);
    }
    session.queue.push(raw_line);
    Ok(())
}

/// Marks the current transaction as dirtied by a queue-time error (e.g. an
/// unknown command submitted inside MULTI). `EXEC` on a dirtied transaction
/// replies `EXECABORT` without running anything queued.
pub fn mark_error(session: &mut ClientSession) {
    session.transaction_errors = true;
}

/// Takes ownership of the queued lines and resets transaction state, ready
/// for the dispatcher to replay them. Must be called *before* replaying any
/// queued command (spec.md §4.F: clearing state before dispatch avoids a
/// replayed MULTI/EXEC re-entering the queue it was just drained from).
///
/// Returns `Err(ExecAborted)` without draining if the transaction was
/// dirtied, and `Err(ExecWithoutMulti)` if there is no open transaction.
pub fn take_for_exec(session: &mut ClientSession) -> Result<Vec<String>, CrimsonError> {
    if !session.in_transaction {
        return Err(CrimsonError::ExecWithoutMulti);
    }
    let dirtied = session.transaction_errors;
    session.in_transaction = false;
    session.transaction_errors = false;
    let queued = std::mem::take(&mut session.queue);
    if dirtied {
        return Err(CrimsonError::ExecAborted);
    }
    Ok(queued)
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

    fn session() -> ClientSession {
        ClientSession::new(1, "127.0.0.1:1".to_string(), Arc::new(NullSink))
    }

    #[test]
    fn nested_multi_is_rejected() {
        let mut s = session();
        begin(&mut s).unwrap();
        assert!(matches!(begin(&mut s), Err(CrimsonError::NestedMulti)));
    }

    #[test]
    fn exec_without_multi_is_an_error() {
        let mut s = session();
        assert!(matches!(
            take_for_exec(&mut s),
            Err(CrimsonError::ExecWithoutMulti)
        ));
    }

    #[test]
    fn discard_without_multi_is_an_error() {
        let mut s = session();
        assert!(matches!(
            discard(&mut s),
            Err(CrimsonError::DiscardWithoutMulti)
        ));
    }

    #[test]
    fn queue_then_exec_drains_in_order() {
        let mut s = session();
        begin(&mut s).unwrap();
        queue(&mut s, "SET a 1".to_string()).unwrap();
        queue(&mut s, "SET b 2".to_string()).unwrap();
        let drained = take_for_exec(&mut s).unwrap();
        assert_eq!(drained, vec!["SET a 1", "SET b 2"]);
        assert!(!s.in_transaction);
        assert!(s.queue.is_empty());
    }

    #[test]
    fn dirtied_transaction_aborts_exec_and_clears_queue() {
        let mut s = session();
        begin(&mut s).unwrap();
        queue(&mut s, "SET a 1".to_string()).unwrap();
        mark_error(&mut s);
        assert!(matches!(take_for_exec(&mut s), Err(CrimsonError::ExecAborted)));
        assert!(!s.in_transaction);
        assert!(s.queue.is_empty());
    }
}

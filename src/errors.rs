//! Crate-wide error type.
//!
//! Mirrors the teacher's `ReplicationError`: one variant per failure class,
//! `thiserror`-derived `Display` impls that double as the text sent back to
//! clients over the wire.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrimsonError {
    #[error("unknown command")]
    UnknownCommand,

    #[error("wrong number of arguments")]
    WrongArity,

    #[error("empty command")]
    EmptyCommand,

    #[error("could not set key")]
    CouldNotSetKey,

    #[error("value is not an integer or out of range")]
    NotAnInteger,

    #[error("invalid port")]
    InvalidPort,

    #[error("MULTI calls can not be nested")]
    NestedMulti,

    #[error("EXEC without MULTI")]
    ExecWithoutMulti,

    #[error("DISCARD without MULTI")]
    DiscardWithoutMulti,

    #[error("EXECABORT Transaction discarded because of previous errors")]
    ExecAborted,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("integer parse error")]
    ParseInt(#[from] std::num::ParseIntError),
}

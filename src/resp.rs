//! RESP reply-byte formatting helpers.
//!
//! spec.md §1 lists this as an external, out-of-scope adapter ("the RESP
//! reply-byte formatting helpers ... treated as straightforward adapters
//! over the core"); it still has to exist for anything else to produce
//! wire bytes, so it lives here as a thin, dependency-free formatter with
//! no protocol logic of its own.

pub fn simple_string(s: &str) -> Vec<u8> {
    format!("+{s}\r\n").into_bytes()
}

pub fn error(s: &str) -> Vec<u8> {
    format!("-{s}\r\n").into_bytes()
}

pub fn integer(n: i64) -> Vec<u8> {
    format!(":{n}\r\n").into_bytes()
}

pub fn bulk_string(bytes: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", bytes.len()).into_bytes();
    out.extend_from_slice(bytes);
    out.extend_from_slice(b"\r\n");
    out
}

pub fn null_bulk() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

pub fn array_header(n: usize) -> Vec<u8> {
    format!("*{n}\r\n").into_bytes()
}

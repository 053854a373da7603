//! Command-line tokenizer (spec.md §4.D, component D).
//!
//! A small state machine, not a `split_whitespace` call, because quoted
//! tokens and the tolerant unterminated-quote behavior (design-notes §9)
//! aren't expressible with the stdlib splitter. Mirrors the byte-oriented,
//! position-tracking style of the teacher's `BufferReader` in spirit, but
//! the token boundaries here are whitespace/quotes rather than fixed widths.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Whitespace,
    Token,
    Quoted,
}

/// Splits a command line into tokens. Trailing `\r\n`/`\n` is stripped
/// first. Quoted tokens preserve internal whitespace; a `\"` inside a
/// quoted token does not close it (the backslash is *not* consumed —
/// design-notes §9 calls this out explicitly as wire-compatible behavior
/// to preserve, not a bug to fix).
pub fn tokenize(line: &str) -> Vec<String> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let line = line.strip_suffix('\r').unwrap_or(line);

    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut state = State::Whitespace;
    let mut prev_byte = 0u8;

    for ch in line.chars() {
        match state {
            State::Whitespace => {
                if ch == '"' {
                    state = State::Quoted;
                } else if !ch.is_whitespace() {
                    current.push(ch);
                    state = State::Token;
                }
            }
            State::Token => {
                if ch.is_whitespace() {
                    tokens.push(std::mem::take(&mut current));
                    state = State::Whitespace;
                } else {
                    current.push(ch);
                }
            }
            State::Quoted => {
                if ch == '"' && prev_byte != b'\\' {
                    tokens.push(std::mem::take(&mut current));
                    state = State::Whitespace;
                } else {
                    current.push(ch);
                }
            }
        }
        prev_byte = ch as u32 as u8;
    }

    // End-of-string: TOKEN commits; QUOTED commits the partial token as-is
    // (tolerant — spec.md §9 says not to silently "fix" this into an error).
    if state != State::Whitespace {
        tokens.push(current);
    }

    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_whitespace() {
        assert_eq!(tokenize("SET foo bar"), vec!["SET", "foo", "bar"]);
    }

    #[test]
    fn strips_trailing_crlf_and_lf() {
        assert_eq!(tokenize("PING\r\n"), vec!["PING"]);
        assert_eq!(tokenize("PING\n"), vec!["PING"]);
    }

    #[test]
    fn quoted_token_preserves_spaces() {
        assert_eq!(
            tokenize(r#"SET k "hello world""#),
            vec!["SET", "k", "hello world"]
        );
    }

    #[test]
    fn unterminated_quote_is_tolerated() {
        assert_eq!(tokenize(r#"SET k "oops"#), vec!["SET", "k", "oops"]);
    }

    #[test]
    fn escaped_quote_does_not_close_token() {
        let tokens = tokenize(r#"SET k "a\"b""#);
        assert_eq!(tokens, vec!["SET", "k", r#"a\"b"#]);
    }

    #[test]
    fn idempotent_on_unquoted_single_space_joined_tokens() {
        let original = vec!["a".to_string(), "bb".to_string(), "ccc".to_string()];
        let joined = original.join(" ");
        assert_eq!(tokenize(&joined), original);
    }
}

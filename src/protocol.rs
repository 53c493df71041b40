/// Size of the buffer both sides read into.
pub const RECV_BUF_LEN: usize = 128;

/// True when `reply` starts with `secret`.
pub fn is_valid_reply(reply: &[u8], secret: &[u8]) -> bool {
    reply.starts_with(secret)
}

/// What a responder should send back for `request`, if anything.
pub fn response_for<'a>(request: &'a [u8], secret: &[u8]) -> Option<&'a [u8]> {
    if !request.is_empty() && request.starts_with(secret) {
        Some(request)
    } else {
        None
    }
}

/// Render a payload for log lines without dumping arbitrary bytes.
pub fn printable(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_echo_is_valid() {
        assert!(is_valid_reply(b"portquiz", b"portquiz"));
    }

    #[test]
    fn longer_reply_with_prefix_is_valid() {
        assert!(is_valid_reply(b"portquiz\n", b"portquiz"));
    }

    #[test]
    fn short_or_garbled_reply_is_not() {
        assert!(!is_valid_reply(b"portq", b"portquiz"));
        assert!(!is_valid_reply(b"HTTP/1.1 400", b"portquiz"));
        assert!(!is_valid_reply(b"", b"portquiz"));
    }

    #[test]
    fn responder_echoes_only_matching_requests() {
        assert_eq!(response_for(b"portquiz", b"portquiz"), Some(&b"portquiz"[..]));
        assert_eq!(response_for(b"GET / HTTP/1.1", b"portquiz"), None);
        assert_eq!(response_for(b"", b""), None);
    }

    #[test]
    fn printable_escapes_line_breaks() {
        assert_eq!(printable(b"a\r\nb"), "a\\r\\nb");
    }
}

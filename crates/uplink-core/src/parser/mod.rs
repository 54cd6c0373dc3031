//! HTTP/1.x request head parser and body decoders
//!
//! The parser is incremental in the simplest sense: it reports `Incomplete`
//! until the blank line ending the head has arrived, then parses the whole
//! head at once. Bodies are decoded separately by [`BodyDecoder`].

mod body;

pub use body::BodyDecoder;

use crate::ProtocolError;
use memchr::memmem;
use smallvec::SmallVec;

/// Maximum number of headers to parse
pub const MAX_HEADERS: usize = 64;

/// Outcome of feeding bytes to a parser
#[derive(Debug, Clone, PartialEq)]
pub enum ParseResult<T> {
    /// Parsed value and the number of input bytes it used
    Complete(T, usize),
    /// Need more data
    Incomplete,
    /// Input can never become valid
    Error(ProtocolError),
}

/// Protocol version of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

/// How the request body is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    None,
    Length(u64),
    Chunked,
}

/// A parsed request line plus headers
#[derive(Debug, Clone, PartialEq)]
pub struct RequestHead {
    /// Method token exactly as sent
    pub method: String,
    /// Origin-form target (`/path?query`); absolute-form is reduced to it
    pub target: String,
    path_len: usize,
    pub version: Version,
    /// Header list with lowercased names, in arrival order
    pub headers: SmallVec<[(String, String); 16]>,
    pub body: BodyKind,
    pub keep_alive: bool,
}

impl RequestHead {
    /// Target without the query string
    pub fn path(&self) -> &str {
        &self.target[..self.path_len]
    }

    /// Raw query string without the leading `?`
    pub fn query(&self) -> Option<&str> {
        self.target.get(self.path_len + 1..)
    }

    /// First header with this (lowercase) name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Upgrade requested to the WebSocket protocol
    pub fn is_websocket_upgrade(&self) -> bool {
        self.header("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
    }
}

#[inline]
fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn is_token(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(is_tchar)
}

/// Reduce a request target to origin-form
fn normalize_target(method: &str, target: &str) -> Option<String> {
    if target.starts_with('/') || target == "*" {
        return Some(target.to_string());
    }

    let lower = target.get(..8).map(|s| s.to_ascii_lowercase()).unwrap_or_default();
    let rest = if lower.starts_with("http://") {
        &target[7..]
    } else if lower.starts_with("https://") {
        &target[8..]
    } else if method == "CONNECT" {
        return Some(target.to_string());
    } else {
        return None;
    };

    match rest.find(|c| c == '/' || c == '?') {
        Some(i) if rest.as_bytes()[i] == b'/' => Some(rest[i..].to_string()),
        Some(i) => Some(format!("/{}", &rest[i..])),
        None => Some("/".to_string()),
    }
}

fn body_kind(headers: &[(String, String)]) -> Result<BodyKind, ProtocolError> {
    let mut transfer_encoding: Option<&str> = None;
    let mut length: Option<u64> = None;

    for (name, value) in headers {
        match name.as_str() {
            // The last header wins for the final coding
            "transfer-encoding" => transfer_encoding = Some(value),
            "content-length" => {
                for part in value.split(',') {
                    let part = part.trim();
                    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                        return Err(ProtocolError::MalformedRequest("content-length"));
                    }
                    let n: u64 = part
                        .parse()
                        .map_err(|_| ProtocolError::MalformedRequest("content-length"))?;
                    if length.is_some_and(|prev| prev != n) {
                        return Err(ProtocolError::ConflictingLength);
                    }
                    length = Some(n);
                }
            }
            _ => {}
        }
    }

    match (transfer_encoding, length) {
        (Some(_), Some(_)) => Err(ProtocolError::ConflictingLength),
        (Some(te), None) => {
            let last = te.rsplit(',').next().unwrap_or("").trim();
            if last.eq_ignore_ascii_case("chunked") {
                Ok(BodyKind::Chunked)
            } else {
                Err(ProtocolError::MalformedRequest("transfer-encoding"))
            }
        }
        (None, Some(0)) | (None, None) => Ok(BodyKind::None),
        (None, Some(n)) => Ok(BodyKind::Length(n)),
    }
}

fn keep_alive(version: Version, headers: &[(String, String)]) -> bool {
    let mut keep = version == Version::Http11;
    for (_, value) in headers.iter().filter(|(k, _)| k == "connection") {
        for token in value.split(',').map(str::trim) {
            if token.eq_ignore_ascii_case("close") {
                return false;
            }
            if token.eq_ignore_ascii_case("keep-alive") {
                keep = true;
            }
        }
    }
    keep
}

/// Parse a request head from the front of `buf`
///
/// Leading empty lines are skipped. The consumed count includes the blank
/// line that terminates the head.
pub fn parse_head(buf: &[u8], max_size: usize, max_headers: usize) -> ParseResult<RequestHead> {
    let mut start = 0;
    while buf[start..].starts_with(b"\r\n") {
        start += 2;
    }

    let end = match memmem::find(&buf[start..], b"\r\n\r\n") {
        Some(end) => end,
        None if buf.len() - start > max_size => {
            return ParseResult::Error(ProtocolError::HeadersTooLarge)
        }
        None => return ParseResult::Incomplete,
    };
    if end > max_size {
        return ParseResult::Error(ProtocolError::HeadersTooLarge);
    }
    let consumed = start + end + 4;

    match parse_lines(&buf[start..start + end], max_headers) {
        Ok(head) => ParseResult::Complete(head, consumed),
        Err(e) => ParseResult::Error(e),
    }
}

fn parse_lines(raw: &[u8], max_headers: usize) -> Result<RequestHead, ProtocolError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| ProtocolError::MalformedRequest("invalid bytes in request head"))?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.splitn(3, ' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) if !t.is_empty() => (m, t, v),
        _ => return Err(ProtocolError::MalformedRequest("request line")),
    };

    if !is_token(method) {
        return Err(ProtocolError::MalformedRequest("method"));
    }
    let version = match version {
        "HTTP/1.1" => Version::Http11,
        "HTTP/1.0" => Version::Http10,
        v if v.starts_with("HTTP/") => return Err(ProtocolError::UnsupportedVersion),
        _ => return Err(ProtocolError::MalformedRequest("request line")),
    };
    if target.bytes().any(|b| b.is_ascii_control()) {
        return Err(ProtocolError::MalformedRequest("request target"));
    }
    let target = normalize_target(method, target)
        .ok_or(ProtocolError::MalformedRequest("request target"))?;

    let mut headers: SmallVec<[(String, String); 16]> = SmallVec::new();
    for line in lines {
        if line.starts_with(' ') || line.starts_with('\t') {
            return Err(ProtocolError::MalformedRequest("obsolete line folding"));
        }
        let (name, value) = line
            .split_once(':')
            .ok_or(ProtocolError::MalformedRequest("header line"))?;
        if !is_token(name) {
            return Err(ProtocolError::MalformedRequest("header name"));
        }
        if headers.len() == max_headers {
            return Err(ProtocolError::TooManyHeaders);
        }
        headers.push((
            name.to_ascii_lowercase(),
            value.trim_matches(|c| c == ' ' || c == '\t').to_string(),
        ));
    }

    let body = body_kind(&headers)?;
    let keep_alive = keep_alive(version, &headers);
    let path_len = target.find('?').unwrap_or(target.len());

    Ok(RequestHead {
        method: method.to_string(),
        target,
        path_len,
        version,
        headers,
        body,
        keep_alive,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &[u8]) -> ParseResult<RequestHead> {
        parse_head(input, 8192, MAX_HEADERS)
    }

    fn complete(input: &[u8]) -> (RequestHead, usize) {
        match parse(input) {
            ParseResult::Complete(head, n) => (head, n),
            other => panic!("expected complete parse, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_simple_get() {
        let input = b"GET /users/42?sort=asc HTTP/1.1\r\nHost: example.com\r\nX-Trace: abc\r\n\r\n";
        let (head, consumed) = complete(input);

        assert_eq!(consumed, input.len());
        assert_eq!(head.method, "GET");
        assert_eq!(head.path(), "/users/42");
        assert_eq!(head.query(), Some("sort=asc"));
        assert_eq!(head.version, Version::Http11);
        assert_eq!(head.header("host"), Some("example.com"));
        assert_eq!(head.header("x-trace"), Some("abc"));
        assert_eq!(head.body, BodyKind::None);
        assert!(head.keep_alive);
    }

    #[test]
    fn test_incomplete_until_blank_line() {
        assert_eq!(parse(b"GET / HTTP/1.1\r\nHost: a\r\n"), ParseResult::Incomplete);
        assert_eq!(parse(b""), ParseResult::Incomplete);
    }

    #[test]
    fn test_pipelined_consumed_count() {
        let input = b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n";
        let (head, consumed) = complete(input);
        assert_eq!(head.path(), "/a");
        let (head, _) = complete(&input[consumed..]);
        assert_eq!(head.path(), "/b");
    }

    #[test]
    fn test_leading_empty_lines_skipped() {
        let (head, consumed) = complete(b"\r\n\r\nGET / HTTP/1.1\r\n\r\n");
        assert_eq!(head.path(), "/");
        assert_eq!(consumed, 22);
    }

    #[test]
    fn test_absolute_form_target() {
        let (head, _) = complete(b"GET http://example.com/a/b?x=1 HTTP/1.1\r\n\r\n");
        assert_eq!(head.target, "/a/b?x=1");

        let (head, _) = complete(b"GET https://example.com HTTP/1.1\r\n\r\n");
        assert_eq!(head.target, "/");
    }

    #[test]
    fn test_empty_query() {
        let (head, _) = complete(b"GET /a? HTTP/1.1\r\n\r\n");
        assert_eq!(head.path(), "/a");
        assert_eq!(head.query(), Some(""));

        let (head, _) = complete(b"GET /a HTTP/1.1\r\n\r\n");
        assert_eq!(head.query(), None);
    }

    #[test]
    fn test_header_whitespace_trimmed() {
        let (head, _) = complete(b"GET / HTTP/1.1\r\nX-A:   padded value \t\r\n\r\n");
        assert_eq!(head.header("x-a"), Some("padded value"));
    }

    #[test]
    fn test_body_framing() {
        let (head, _) = complete(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\n");
        assert_eq!(head.body, BodyKind::Length(5));

        let (head, _) = complete(b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip, chunked\r\n\r\n");
        assert_eq!(head.body, BodyKind::Chunked);

        let (head, _) = complete(b"POST / HTTP/1.1\r\nContent-Length: 0\r\n\r\n");
        assert_eq!(head.body, BodyKind::None);
    }

    #[test]
    fn test_conflicting_lengths_rejected() {
        assert_eq!(
            parse(b"POST / HTTP/1.1\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n"),
            ParseResult::Error(ProtocolError::ConflictingLength)
        );
        assert_eq!(
            parse(b"POST / HTTP/1.1\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\n"),
            ParseResult::Error(ProtocolError::ConflictingLength)
        );
        assert!(matches!(
            parse(b"POST / HTTP/1.1\r\nContent-Length: -1\r\n\r\n"),
            ParseResult::Error(ProtocolError::MalformedRequest(_))
        ));
    }

    #[test]
    fn test_keep_alive_rules() {
        let (head, _) = complete(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
        assert!(!head.keep_alive);

        let (head, _) = complete(b"GET / HTTP/1.0\r\n\r\n");
        assert!(!head.keep_alive);
        assert_eq!(head.version, Version::Http10);

        let (head, _) = complete(b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n");
        assert!(head.keep_alive);
    }

    #[test]
    fn test_malformed_requests() {
        assert!(matches!(parse(b"GET\r\n\r\n"), ParseResult::Error(_)));
        assert!(matches!(parse(b"GET / FTP/1.0\r\n\r\n"), ParseResult::Error(_)));
        assert!(matches!(parse(b"G(T / HTTP/1.1\r\n\r\n"), ParseResult::Error(_)));
        assert!(matches!(parse(b"GET / HTTP/1.1\r\nNoColon\r\n\r\n"), ParseResult::Error(_)));
        assert!(matches!(parse(b"GET / HTTP/1.1\r\nA: b\r\n folded\r\n\r\n"), ParseResult::Error(_)));
        assert_eq!(
            parse(b"GET / HTTP/2.0\r\n\r\n"),
            ParseResult::Error(ProtocolError::UnsupportedVersion)
        );
    }

    #[test]
    fn test_header_limits() {
        let mut big = b"GET / HTTP/1.1\r\nX: ".to_vec();
        big.extend(std::iter::repeat(b'a').take(9000));
        assert_eq!(parse(&big), ParseResult::Error(ProtocolError::HeadersTooLarge));

        let mut many = b"GET / HTTP/1.1\r\n".to_vec();
        for i in 0..=MAX_HEADERS {
            many.extend_from_slice(format!("X-{}: v\r\n", i).as_bytes());
        }
        many.extend_from_slice(b"\r\n");
        assert_eq!(parse(&many), ParseResult::Error(ProtocolError::TooManyHeaders));
    }

    #[test]
    fn test_websocket_upgrade_detection() {
        let (head, _) = complete(b"GET /ws HTTP/1.1\r\nUpgrade: WebSocket\r\nConnection: Upgrade\r\n\r\n");
        assert!(head.is_websocket_upgrade());

        let (head, _) = complete(b"GET /ws HTTP/1.1\r\n\r\n");
        assert!(!head.is_websocket_upgrade());
    }
}

use super::{Headers, HeadersExt, Method, Version};
use std::str::FromStr;

/// A stateless, idempotent parse result. `Request::parse` never panics
/// and never blocks; callers treat `Malformed` as 400 Bad Request.
#[derive(Debug)]
pub enum ParseOutcome {
    Complete(Request),
    Malformed,
    /// `POST` with neither `Content-Length` nor `Transfer-Encoding: chunked`.
    LengthRequired,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub query_string: Option<String>,
    pub version: Version,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// Number of bytes of the input buffer this request consumed. The
    /// event loop removes exactly this many bytes from the connection's
    /// recv buffer.
    pub parsed_length: usize,
}

const MAX_JUNK_PROBE: usize = 8192;

impl Request {
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers.get_ci(name)
    }

    pub fn content_length(&self) -> Option<usize> {
        self.get_header("content-length").and_then(|v| v.trim().parse().ok())
    }

    pub fn is_chunked(&self) -> bool {
        self.get_header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    /// Returns true iff a full request is present in `buf`, or the buffer
    /// is unambiguously not an HTTP request (so the caller can hand it to
    /// `parse`, get `Malformed`, and emit 400 without waiting forever for
    /// bytes that will never complete a request).
    pub fn is_complete(buf: &[u8]) -> bool {
        match find_header_terminator(buf) {
            Some(header_end) => {
                let header_part = match std::str::from_utf8(&buf[..header_end]) {
                    Ok(s) => s,
                    Err(_) => return true, // not valid UTF-8 header text: junk, let parse fail
                };
                let body_start = header_end + 4;
                let body = &buf[body_start..];

                if is_chunked_header_block(header_part) {
                    return dechunk(body).is_some();
                }
                match content_length_header(header_part) {
                    Some(len) => body.len() >= len,
                    None => true, // no declared body: request line + headers is the whole request
                }
            }
            None => looks_like_junk(buf),
        }
    }

    /// Parses one request out of `buf`. Assumes `is_complete(buf)` was
    /// already true; if the headers are well-formed but the body isn't
    /// fully present yet, behavior is unspecified (callers must check
    /// completeness first).
    pub fn parse(buf: &[u8]) -> ParseOutcome {
        let header_end = match find_header_terminator(buf) {
            Some(pos) => pos,
            None => return ParseOutcome::Malformed,
        };
        let header_part = match std::str::from_utf8(&buf[..header_end]) {
            Ok(s) => s,
            Err(_) => return ParseOutcome::Malformed,
        };
        let body_start = header_end + 4;

        let mut lines = header_part.split("\r\n");
        let request_line = match lines.next() {
            Some(l) if !l.is_empty() => l,
            _ => return ParseOutcome::Malformed,
        };

        let (method, raw_uri, version) = match parse_request_line(request_line) {
            Some(t) => t,
            None => return ParseOutcome::Malformed,
        };
        if !version.is_supported() {
            return ParseOutcome::Malformed;
        }

        let mut headers = Headers::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            // Folded continuation lines (leading whitespace) are not
            // supported; a line without ':' is ignored.
            if line.starts_with(' ') || line.starts_with('\t') {
                continue;
            }
            if let Some(colon) = line.find(':') {
                let name = line[..colon].trim().to_ascii_lowercase();
                let value = line[colon + 1..].trim().to_string();
                headers.insert(name, value);
            }
        }

        let (uri, query_string) = match raw_uri.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (raw_uri.to_string(), None),
        };

        let is_chunked = headers
            .get_ci("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);

        let (body, consumed_body_len) = if is_chunked {
            match dechunk(&buf[body_start..]) {
                Some((decoded, used)) => (decoded, used),
                None => return ParseOutcome::Malformed,
            }
        } else if let Some(len) = headers.get_ci("content-length").and_then(|v| v.trim().parse::<usize>().ok()) {
            let available = buf.len() - body_start;
            // Declared smaller than received is malformed; declared larger
            // than received should never reach parse() since is_complete()
            // would have reported false.
            if available != len {
                return ParseOutcome::Malformed;
            }
            (buf[body_start..body_start + len].to_vec(), len)
        } else {
            if method == Method::Post {
                return ParseOutcome::LengthRequired;
            }
            (Vec::new(), 0)
        };

        ParseOutcome::Complete(Request {
            method,
            uri,
            query_string,
            version,
            headers,
            body,
            parsed_length: body_start + consumed_body_len,
        })
    }
}

fn parse_request_line(line: &str) -> Option<(Method, &str, Version)> {
    let mut parts = line.split(' ').filter(|s| !s.is_empty());
    let method_str = parts.next()?;
    let uri = parts.next()?;
    let version_str = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let method = Method::from_str(method_str).ok()?;
    let version = Version::from_str(version_str).ok()?;
    Some((method, uri, version))
}

fn find_header_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn content_length_header(header_block: &str) -> Option<usize> {
    for line in header_block.split("\r\n").skip(1) {
        if let Some(colon) = line.find(':') {
            if line[..colon].eq_ignore_ascii_case("content-length") {
                return line[colon + 1..].trim().parse().ok();
            }
        }
    }
    None
}

fn is_chunked_header_block(header_block: &str) -> bool {
    for line in header_block.split("\r\n").skip(1) {
        if let Some(colon) = line.find(':') {
            if line[..colon].eq_ignore_ascii_case("transfer-encoding") {
                return line[colon + 1..].to_ascii_lowercase().contains("chunked");
            }
        }
    }
    false
}

/// Heuristic used only when no `\r\n\r\n` terminator is present yet:
/// decide whether the buffer can never become a valid request, so the
/// loop should stop waiting and let `parse` fail it as 400 rather than
/// buffering forever.
fn looks_like_junk(buf: &[u8]) -> bool {
    if buf.len() > MAX_JUNK_PROBE {
        return true;
    }
    let has_bare_lf_without_crlf_header_line = buf.contains(&b'\n') && !buf.windows(2).any(|w| w == b"\r\n");
    if has_bare_lf_without_crlf_header_line {
        return true;
    }
    let short_without_space = buf.len() < 8 && !buf.contains(&b' ') && !buf.is_empty();
    short_without_space
}

/// Decodes `Transfer-Encoding: chunked` framing. Returns the decoded body
/// and the number of input bytes consumed (through the terminating
/// `0\r\n\r\n`), or `None` if the terminator isn't present yet (or the
/// framing is malformed in a way that can be detected now).
fn dechunk(body: &[u8]) -> Option<(Vec<u8>, usize)> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    loop {
        let line_end = pos + body[pos..].windows(2).position(|w| w == b"\r\n")?;
        let size_str = std::str::from_utf8(&body[pos..line_end]).ok()?;
        let size_str = size_str.split(';').next().unwrap_or(size_str).trim();
        let size = usize::from_str_radix(size_str, 16).ok()?;
        let chunk_start = line_end + 2;

        if size == 0 {
            // Last chunk: require the terminating CRLF after the "0" line.
            if body.get(chunk_start..chunk_start + 2) == Some(b"\r\n") {
                return Some((out, chunk_start + 2));
            }
            return None;
        }

        let chunk_end = chunk_start + size;
        if body.len() < chunk_end + 2 {
            return None;
        }
        if &body[chunk_end..chunk_end + 2] != b"\r\n" {
            return None;
        }
        out.extend_from_slice(&body[chunk_start..chunk_end]);
        pos = chunk_end + 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_get() {
        let raw = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        assert!(Request::is_complete(raw));
        match Request::parse(raw) {
            ParseOutcome::Complete(r) => {
                assert_eq!(r.method, Method::Get);
                assert_eq!(r.uri, "/");
                assert_eq!(r.parsed_length, raw.len());
            }
            other => panic!("expected complete parse, got {:?}", other),
        }
    }

    #[test]
    fn incomplete_body_is_not_complete() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc";
        assert!(!Request::is_complete(raw));
    }

    #[test]
    fn body_declared_smaller_than_received_is_malformed() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 3\r\n\r\nabcdef";
        assert!(Request::is_complete(raw));
        match Request::parse(raw) {
            ParseOutcome::Malformed => {}
            other => panic!("declared-smaller-than-received must be malformed, got {:?}", other),
        }
    }

    #[test]
    fn post_without_length_or_chunked_requires_length() {
        let raw = b"POST / HTTP/1.1\r\nHost: x\r\n\r\n";
        match Request::parse(raw) {
            ParseOutcome::LengthRequired => {}
            other => panic!("expected LengthRequired, got {:?}", other),
        }
    }

    #[test]
    fn chunked_body_is_decoded() {
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n0\r\n\r\n";
        assert!(Request::is_complete(raw));
        match Request::parse(raw) {
            ParseOutcome::Complete(r) => assert_eq!(r.body, b"Wiki"),
            other => panic!("expected complete parse, got {:?}", other),
        }
    }

    #[test]
    fn unsupported_version_is_malformed() {
        let raw = b"GET / HTTP/2.0\r\nHost: x\r\n\r\n";
        match Request::parse(raw) {
            ParseOutcome::Malformed => {}
            other => panic!("HTTP/2.0 must be rejected, got {:?}", other),
        }
    }

    #[test]
    fn query_string_is_split_from_uri() {
        let raw = b"GET /cgi/test.php?name=bob HTTP/1.1\r\nHost: x\r\n\r\n";
        match Request::parse(raw) {
            ParseOutcome::Complete(r) => {
                assert_eq!(r.uri, "/cgi/test.php");
                assert_eq!(r.query_string.as_deref(), Some("name=bob"));
            }
            other => panic!("expected complete parse, got {:?}", other),
        }
    }

    #[test]
    fn post_with_zero_content_length_yields_empty_body() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 0\r\n\r\n";
        match Request::parse(raw) {
            ParseOutcome::Complete(r) => assert!(r.body.is_empty()),
            other => panic!("expected complete parse, got {:?}", other),
        }
    }
}

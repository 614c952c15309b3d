//! Reference `RequestParser` — the HTTP/1.x collaborator contract a
//! [`crate::channel::Channel`] drives (spec §6 "Parser").
//!
//! Grounded on the teacher's `src/http/request.rs`
//! (`parse_request_line`/`extract_and_parse_header`/`find_crlf`), trimmed
//! of CGI dispatch, multipart, and chunked transfer-encoding — none of
//! which this crate's scope covers. Request-line + headers +
//! `Content-Length` body is enough to drive every scenario in spec.md §8.

use std::fmt;

/// Everything a [`crate::channel::Channel`] needs from a parsed request to
/// decide what to do next. Implementors own their own buffering.
pub trait RequestParser: Send + fmt::Debug {
    /// Feed newly-read socket bytes; returns the number consumed (the rest
    /// belongs to the next request, e.g. a pipelined sibling).
    fn received(&mut self, data: &[u8]) -> usize;

    /// A full request (headers, and body if any) has been parsed.
    fn completed(&self) -> bool;

    /// Headers are in, regardless of whether the body has arrived yet —
    /// enough to answer a `100-continue` preface and to build a synthetic
    /// error reflection.
    fn headers_finished(&self) -> bool;

    /// True for a parse that consumed bytes but yielded nothing (the
    /// idle-keepalive case — a closed connection sending nothing at all).
    fn empty(&self) -> bool;

    fn error(&self) -> Option<&str>;

    fn expect_continue(&self) -> bool;

    /// Clear the latch after the 100-continue preface has been sent, per
    /// spec.md §4.3's "at most once" invariant.
    fn clear_expect_continue(&mut self);

    fn version(&self) -> &str;

    fn method(&self) -> &str;

    fn path(&self) -> &str;

    fn header(&self, name: &str) -> Option<&str>;

    fn body(&self) -> &[u8];

    /// Reset state so the same parser instance can be reused for the next
    /// pipelined request on this channel.
    fn clear(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    RequestLine,
    Headers,
    Body,
    Done,
}

/// Minimal HTTP/1.x parser: request line, headers, `Content-Length` body.
/// Chunked transfer-encoding and multipart bodies are out of scope.
pub struct HttpRequestParser {
    stage: Stage,
    scratch: Vec<u8>,
    method: String,
    path: String,
    version: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    content_length: Option<usize>,
    expect_continue: bool,
    error: Option<String>,
    saw_any_bytes: bool,
}

impl Default for HttpRequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpRequestParser {
    pub fn new() -> Self {
        Self {
            stage: Stage::RequestLine,
            scratch: Vec::new(),
            method: String::new(),
            path: String::new(),
            version: String::new(),
            headers: Vec::new(),
            body: Vec::new(),
            content_length: None,
            expect_continue: false,
            error: None,
            saw_any_bytes: false,
        }
    }

    fn find_crlf(buf: &[u8]) -> Option<usize> {
        buf.windows(2).position(|w| w == b"\r\n")
    }

    fn parse_request_line(&mut self, line: &str) {
        let mut parts = line.splitn(3, ' ');
        let (method, path, version) = (parts.next(), parts.next(), parts.next());
        match (method, path, version) {
            (Some(m), Some(p), Some(v)) if v.starts_with("HTTP/") => {
                self.method = m.to_string();
                self.path = p.to_string();
                self.version = v.trim_end().to_string();
            }
            _ => self.error = Some(format!("malformed request line: {line:?}")),
        }
    }

    fn parse_header_line(&mut self, line: &str) {
        match line.split_once(':') {
            Some((name, value)) => {
                let name = name.trim().to_string();
                let value = value.trim().to_string();
                if name.eq_ignore_ascii_case("content-length") {
                    self.content_length = value.parse().ok();
                }
                if name.eq_ignore_ascii_case("expect") && value.eq_ignore_ascii_case("100-continue")
                {
                    self.expect_continue = true;
                }
                self.headers.push((name, value));
            }
            None => self.error = Some(format!("malformed header line: {line:?}")),
        }
    }
}

impl fmt::Debug for HttpRequestParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRequestParser")
            .field("stage", &self.stage)
            .field("method", &self.method)
            .field("path", &self.path)
            .finish()
    }
}

impl RequestParser for HttpRequestParser {
    fn received(&mut self, data: &[u8]) -> usize {
        if !data.is_empty() {
            self.saw_any_bytes = true;
        }
        let old_len = self.scratch.len();
        self.scratch.extend_from_slice(data);
        let mut consumed = 0usize;

        loop {
            match self.stage {
                Stage::RequestLine => match Self::find_crlf(&self.scratch[consumed..]) {
                    Some(at) => {
                        let line_end = consumed + at;
                        let line = String::from_utf8_lossy(&self.scratch[consumed..line_end]).into_owned();
                        self.parse_request_line(&line);
                        consumed = line_end + 2;
                        self.stage = Stage::Headers;
                        if self.error.is_some() {
                            self.stage = Stage::Done;
                            break;
                        }
                    }
                    None => break,
                },
                Stage::Headers => match Self::find_crlf(&self.scratch[consumed..]) {
                    Some(at) => {
                        let line_end = consumed + at;
                        if line_end == consumed {
                            // blank line: headers finished
                            consumed += 2;
                            self.stage = match self.content_length {
                                Some(0) | None => Stage::Done,
                                Some(_) => Stage::Body,
                            };
                        } else {
                            let line =
                                String::from_utf8_lossy(&self.scratch[consumed..line_end]).into_owned();
                            self.parse_header_line(&line);
                            consumed = line_end + 2;
                            if self.error.is_some() {
                                self.stage = Stage::Done;
                                break;
                            }
                        }
                    }
                    None => break,
                },
                Stage::Body => {
                    let want = self.content_length.unwrap_or(0);
                    let have = self.scratch.len() - consumed;
                    let take = have.min(want - self.body.len());
                    self.body.extend_from_slice(&self.scratch[consumed..consumed + take]);
                    consumed += take;
                    if self.body.len() >= want {
                        self.stage = Stage::Done;
                    } else {
                        break;
                    }
                }
                Stage::Done => break,
            }
        }

        self.scratch.drain(..consumed);
        consumed.saturating_sub(old_len)
    }

    fn completed(&self) -> bool {
        self.stage == Stage::Done
    }

    fn headers_finished(&self) -> bool {
        matches!(self.stage, Stage::Body | Stage::Done) && !self.version.is_empty()
    }

    fn empty(&self) -> bool {
        self.stage == Stage::RequestLine && !self.saw_any_bytes
    }

    fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn expect_continue(&self) -> bool {
        self.expect_continue
    }

    fn clear_expect_continue(&mut self) {
        self.expect_continue = false;
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn method(&self) -> &str {
        &self.method
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn body(&self) -> &[u8] {
        &self.body
    }

    fn clear(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_get() {
        let mut p = HttpRequestParser::new();
        let n = p.received(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(n, 34);
        assert!(p.completed());
        assert_eq!(p.method(), "GET");
        assert_eq!(p.path(), "/hello");
        assert_eq!(p.version(), "HTTP/1.1");
        assert_eq!(p.header("Host"), Some("x"));
    }

    #[test]
    fn parses_body_by_content_length() {
        let mut p = HttpRequestParser::new();
        p.received(b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello");
        assert!(p.completed());
        assert_eq!(p.body(), b"hello");
    }

    #[test]
    fn detects_expect_continue() {
        let mut p = HttpRequestParser::new();
        p.received(b"POST /x HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 2\r\n\r\n");
        assert!(p.headers_finished());
        assert!(p.expect_continue());
        assert!(!p.completed());
        p.clear_expect_continue();
        assert!(!p.expect_continue());
    }

    #[test]
    fn splits_pipelined_requests() {
        let mut p = HttpRequestParser::new();
        let both = b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n";
        let n = p.received(both);
        assert!(p.completed());
        assert_eq!(p.path(), "/a");
        assert!(n < both.len());

        let mut p2 = HttpRequestParser::new();
        p2.received(&both[n..]);
        assert!(p2.completed());
        assert_eq!(p2.path(), "/b");
    }

    #[test]
    fn malformed_request_line_sets_error() {
        let mut p = HttpRequestParser::new();
        p.received(b"not a request\r\n\r\n");
        assert!(p.error().is_some());
    }

    #[test]
    fn empty_read_is_idle_not_error() {
        let p = HttpRequestParser::new();
        assert!(p.empty());
    }
}

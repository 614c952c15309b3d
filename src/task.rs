//! `Task`/`RequestFactory` — the application-execution collaborator
//! contract (spec §6) plus a reference implementation sufficient to drive
//! the crate end to end.
//!
//! Grounded on the teacher's `src/http/response.rs` (`HttpResponse`,
//! `status_text`, header formatting) for response construction, and on
//! `original_source/waitress/channel.py`'s `service()` for the
//! error-task/500 contract: a worker that raises before writing any bytes
//! gets a synthetic 500 with the original `Connection` header preserved.

use std::fmt::Write as _;

use crate::channel::Channel;
use crate::error::Result;
use crate::parser::RequestParser;

/// Executed by a worker thread against a completed request. `service`
/// writes its response via [`Channel::write_soon`] and reports back
/// whether it already wrote a status line (so `Channel::service` knows
/// whether it's safe to synthesize a 500) and whether the connection
/// should close once flushed.
pub trait Task: Send {
    fn service(&mut self, channel: &Channel) -> Result<()>;
    fn wrote_header(&self) -> bool;
    fn close_on_finish(&self) -> bool;
}

/// Builds parsers and tasks for a channel. Stands in for the teacher's
/// `parser_class`/`task_class`/`error_task_class` trio of pluggable types.
pub trait RequestFactory: Send + Sync {
    fn new_parser(&self) -> Box<dyn RequestParser>;
    fn make_task(&self, request: Box<dyn RequestParser>) -> Box<dyn Task>;
    fn make_error_task(&self, request: Box<dyn RequestParser>) -> Box<dyn Task>;
}

fn status_line(version: &str, code: u16, reason: &str) -> String {
    format!("{version} {code} {reason}\r\n")
}

fn write_head(buf: &mut String, headers: &[(&str, String)]) {
    for (name, value) in headers {
        let _ = writeln!(buf, "{name}: {value}\r");
    }
    buf.push_str("\r\n");
}

/// Reference `Task`: echoes method/path/body back as a 200, honoring
/// `Connection: close` from the request.
pub struct EchoTask {
    method: String,
    path: String,
    version: String,
    body: Vec<u8>,
    connection: Option<String>,
    wrote_header: bool,
    close_on_finish: bool,
}

impl EchoTask {
    pub fn from_request(request: &dyn RequestParser) -> Self {
        let connection = request.header("Connection").map(|s| s.to_string());
        let close_on_finish = connection.as_deref().is_some_and(|c| c.eq_ignore_ascii_case("close"))
            || request.version() == "HTTP/1.0" && connection.is_none();
        Self {
            method: request.method().to_string(),
            path: request.path().to_string(),
            version: request.version().to_string(),
            body: request.body().to_vec(),
            connection,
            wrote_header: false,
            close_on_finish,
        }
    }
}

impl Task for EchoTask {
    fn service(&mut self, channel: &Channel) -> Result<()> {
        let mut body = format!("{} {}\n", self.method, self.path).into_bytes();
        body.extend_from_slice(&self.body);

        let mut head = String::new();
        head.push_str(&status_line(&self.version, 200, "OK"));
        let mut headers = vec![
            ("Content-Length", body.len().to_string()),
            ("Content-Type", "text/plain; charset=utf-8".to_string()),
        ];
        if let Some(c) = &self.connection {
            headers.push(("Connection", c.clone()));
        }
        write_head(&mut head, &headers);

        channel.write_soon(head.into_bytes())?;
        self.wrote_header = true;
        channel.write_soon(body)?;
        Ok(())
    }

    fn wrote_header(&self) -> bool {
        self.wrote_header
    }

    fn close_on_finish(&self) -> bool {
        self.close_on_finish
    }
}

/// Synthetic 500, built from whatever the parser salvaged before it
/// failed (version + `Connection` header), per spec.md §7's "preserve the
/// Connection header when synthesizing a 500" rule.
pub struct ErrorTask {
    version: String,
    connection: Option<String>,
    message: String,
    expose_tracebacks: bool,
    wrote_header: bool,
}

impl ErrorTask {
    pub fn new(version: String, connection: Option<String>, message: String, expose_tracebacks: bool) -> Self {
        Self { version, connection, message, expose_tracebacks, wrote_header: false }
    }
}

impl Task for ErrorTask {
    fn service(&mut self, channel: &Channel) -> Result<()> {
        let body = if self.expose_tracebacks {
            format!("Internal Server Error\n\n{}\n", self.message)
        } else {
            "Internal Server Error\n".to_string()
        };
        let body = body.into_bytes();

        let version = if self.version.is_empty() { "HTTP/1.0" } else { self.version.as_str() };
        let mut head = String::new();
        head.push_str(&status_line(version, 500, "Internal Server Error"));
        let mut headers = vec![
            ("Content-Length", body.len().to_string()),
            ("Content-Type", "text/plain; charset=utf-8".to_string()),
        ];
        let connection = self.connection.clone().unwrap_or_else(|| "close".to_string());
        headers.push(("Connection", connection));
        write_head(&mut head, &headers);

        channel.write_soon(head.into_bytes())?;
        self.wrote_header = true;
        channel.write_soon(body)?;
        Ok(())
    }

    fn wrote_header(&self) -> bool {
        self.wrote_header
    }

    fn close_on_finish(&self) -> bool {
        true
    }
}

/// Default [`RequestFactory`]: [`crate::parser::HttpRequestParser`] paired
/// with [`EchoTask`]/[`ErrorTask`].
pub struct EchoFactory {
    pub expose_tracebacks: bool,
}

impl RequestFactory for EchoFactory {
    fn new_parser(&self) -> Box<dyn RequestParser> {
        Box::new(crate::parser::HttpRequestParser::new())
    }

    fn make_task(&self, request: Box<dyn RequestParser>) -> Box<dyn Task> {
        Box::new(EchoTask::from_request(request.as_ref()))
    }

    fn make_error_task(&self, request: Box<dyn RequestParser>) -> Box<dyn Task> {
        let version = if request.version().is_empty() {
            "HTTP/1.0".to_string()
        } else {
            request.version().to_string()
        };
        let connection = request.header("Connection").map(|s| s.to_string());
        let message = request.error().unwrap_or("internal error").to_string();
        Box::new(ErrorTask::new(version, connection, message, self.expose_tracebacks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::HttpRequestParser;

    #[test]
    fn echo_task_preserves_connection_header() {
        let mut p = HttpRequestParser::new();
        p.received(b"GET /x HTTP/1.1\r\nConnection: close\r\n\r\n");
        let task = EchoTask::from_request(&p);
        assert!(task.close_on_finish());
    }

    #[test]
    fn http_1_0_without_connection_header_closes_by_default() {
        let mut p = HttpRequestParser::new();
        p.received(b"GET /x HTTP/1.0\r\n\r\n");
        let task = EchoTask::from_request(&p);
        assert!(task.close_on_finish());
    }

    #[test]
    fn error_task_defaults_to_close_when_no_connection_header() {
        let task = ErrorTask::new("HTTP/1.1".into(), None, "boom".into(), false);
        assert!(task.close_on_finish());
    }
}

//! Response state tracking and the response sink seam.
//!
//! [`ResponseState`] is the per-request bookkeeping for what has been sent:
//! status, pending headers, and a bytes-written counter that distinguishes
//! "nothing written yet" from "an empty body was flushed". Headers are flushed
//! lazily — the first body write (or an explicit [`finalize_head`]) pushes the
//! status line and headers to the [`ResponseSink`] exactly once; after that,
//! status changes degrade to a warning instead of corrupting the wire.
//!
//! [`BufferSink`] is the bundled sink: it buffers the whole response and
//! serializes it to HTTP/1.1 wire format, which is also what the tests
//! assert against.
//!
//! [`finalize_head`]: ResponseState::finalize_head

use std::any::Any;
use std::io;

use bytes::{BufMut, BytesMut};

use crate::http::{Headers, StatusCode};

/// Destination for response head and body bytes.
///
/// Implementations receive the status line and headers exactly once, before
/// any body bytes. `flush` is a capability hook with a no-op default; sinks
/// that buffer an entire response (like [`BufferSink`]) have nothing to do
/// mid-request.
pub trait ResponseSink: Send + 'static {
    /// Accepts the status line and headers. Called at most once per request.
    fn write_head(&mut self, status: StatusCode, headers: &Headers) -> io::Result<()>;

    /// Accepts a chunk of body bytes; returns how many were consumed.
    fn write_body(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Pushes buffered bytes toward the transport, when the sink can.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Recovers the concrete sink type after a dispatch round-trip.
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// Per-request response bookkeeping over a type-erased [`ResponseSink`].
pub struct ResponseState {
    sink: Option<Box<dyn ResponseSink>>,
    status: StatusCode,
    headers: Headers,
    /// `None` until the head is flushed; `Some(n)` counts body bytes since.
    /// The two states drive the not-found fallback: `None` means a default
    /// error page may still be rendered.
    size: Option<usize>,
}

impl ResponseState {
    /// An unbound state for idle pooled contexts.
    pub(crate) fn idle() -> Self {
        Self {
            sink: None,
            status: StatusCode::Ok,
            headers: Headers::new(),
            size: None,
        }
    }

    /// Rebinds this state to a fresh sink and clears all prior bookkeeping.
    pub(crate) fn reset(&mut self, sink: Box<dyn ResponseSink>) {
        self.sink = Some(sink);
        self.status = StatusCode::Ok;
        self.headers.clear();
        self.size = None;
    }

    pub(crate) fn take_sink(&mut self) -> Option<Box<dyn ResponseSink>> {
        self.sink.take()
    }

    /// The current response status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Sets the response status.
    ///
    /// Only effective before the head is flushed. Afterwards the attempt is
    /// logged and the original status preserved — a degraded condition, not
    /// an error.
    pub fn set_status(&mut self, status: StatusCode) {
        if self.status == status {
            return;
        }
        if self.written() {
            tracing::warn!(
                current = self.status.as_u16(),
                requested = status.as_u16(),
                "headers already written; status change ignored"
            );
            return;
        }
        self.status = status;
    }

    /// The pending (or sent) response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Replaces a response header. No-op after the head is flushed.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        if self.written() {
            tracing::warn!("headers already written; header change ignored");
            return;
        }
        self.headers.set(name, value);
    }

    /// Appends a response header, preserving existing values with the same name.
    pub fn append_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        if self.written() {
            tracing::warn!("headers already written; header change ignored");
            return;
        }
        self.headers.insert(name, value);
    }

    /// `true` once the status line and headers have been handed to the sink.
    pub fn written(&self) -> bool {
        self.size.is_some()
    }

    /// Body bytes written so far; `None` when the head has not been flushed.
    pub fn bytes_written(&self) -> Option<usize> {
        self.size
    }

    /// Flushes the status line and headers to the sink. Idempotent.
    ///
    /// Called implicitly by the first body write, and by the dispatcher at
    /// the end of every request so even empty-body responses send a head.
    pub fn finalize_head(&mut self) -> io::Result<()> {
        if self.size.is_some() {
            return Ok(());
        }
        self.size = Some(0);
        if let Some(sink) = self.sink.as_mut() {
            sink.write_head(self.status, &self.headers)?;
        }
        Ok(())
    }

    /// Writes body bytes, flushing the head first if necessary.
    pub fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.finalize_head()?;
        let n = match self.sink.as_mut() {
            Some(sink) => sink.write_body(data)?,
            None => data.len(),
        };
        if let Some(size) = self.size.as_mut() {
            *size += n;
        }
        Ok(n)
    }

    /// Writes a string body, flushing the head first if necessary.
    pub fn write_str(&mut self, s: &str) -> io::Result<usize> {
        self.write(s.as_bytes())
    }
}

/// A [`ResponseSink`] that buffers the full response and serializes it to
/// HTTP/1.1 wire format on [`finish`](BufferSink::finish).
///
/// Used by the bundled TCP server and throughout the test suite.
pub struct BufferSink {
    keep_alive: bool,
    head: Option<(StatusCode, Headers)>,
    body: BytesMut,
}

impl BufferSink {
    pub fn new(keep_alive: bool) -> Self {
        Self {
            keep_alive,
            head: None,
            body: BytesMut::new(),
        }
    }

    /// The status accepted by `write_head`, if the head arrived.
    pub fn status(&self) -> Option<StatusCode> {
        self.head.as_ref().map(|(s, _)| *s)
    }

    /// The headers accepted by `write_head`, if the head arrived.
    pub fn headers(&self) -> Option<&Headers> {
        self.head.as_ref().map(|(_, h)| h)
    }

    /// The buffered body bytes.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The buffered body as UTF-8, lossy.
    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Serializes the buffered response into HTTP/1.1 wire bytes.
    ///
    /// Adds `Content-Type: text/plain; charset=utf-8` for non-empty bodies
    /// without an explicit type, and fills in `Content-Length` and the
    /// `Connection` header this sink was created with unless the response
    /// already set them.
    pub fn finish(self) -> BytesMut {
        let (status, headers) = self
            .head
            .unwrap_or_else(|| (StatusCode::Ok, Headers::new()));
        let content_length = self.body.len();

        let estimated_size = 128 + headers.len() * 64 + content_length;
        let mut buf = BytesMut::with_capacity(estimated_size);

        buf.put(format!("HTTP/1.1 {} {}\r\n", status.as_u16(), status.canonical_reason()).as_bytes());

        for (name, value) in headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }

        if content_length > 0 && !headers.contains("content-type") {
            buf.put(&b"Content-Type: text/plain; charset=utf-8\r\n"[..]);
        }

        if !headers.contains("connection") {
            let connection = if self.keep_alive { "keep-alive" } else { "close" };
            buf.put(format!("Connection: {connection}\r\n").as_bytes());
        }
        if !headers.contains("content-length") {
            buf.put(format!("Content-Length: {content_length}\r\n").as_bytes());
        }
        buf.put(&b"\r\n"[..]);

        if !self.body.is_empty() {
            buf.put(&self.body[..]);
        }

        buf
    }
}

impl ResponseSink for BufferSink {
    fn write_head(&mut self, status: StatusCode, headers: &Headers) -> io::Result<()> {
        if self.head.is_none() {
            self.head = Some((status, headers.clone()));
        }
        Ok(())
    }

    fn write_body(&mut self, data: &[u8]) -> io::Result<usize> {
        self.body.extend_from_slice(data);
        Ok(data.len())
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound_state() -> ResponseState {
        let mut state = ResponseState::idle();
        state.reset(Box::new(BufferSink::new(true)));
        state
    }

    fn unwrap_sink(state: &mut ResponseState) -> BufferSink {
        let sink = state.take_sink().unwrap();
        *sink.into_any().downcast::<BufferSink>().unwrap()
    }

    #[test]
    fn size_starts_unwritten() {
        let state = bound_state();
        assert!(!state.written());
        assert_eq!(state.bytes_written(), None);
        assert_eq!(state.status(), StatusCode::Ok);
    }

    #[test]
    fn finalize_distinguishes_empty_body_from_unwritten() {
        let mut state = bound_state();
        state.finalize_head().unwrap();
        assert!(state.written());
        assert_eq!(state.bytes_written(), Some(0));
    }

    #[test]
    fn first_write_flushes_head() {
        let mut state = bound_state();
        state.set_status(StatusCode::Created);
        state.set_header("X-Thing", "yes");
        state.write_str("hello").unwrap();
        assert_eq!(state.bytes_written(), Some(5));

        let sink = unwrap_sink(&mut state);
        assert_eq!(sink.status(), Some(StatusCode::Created));
        assert_eq!(sink.headers().unwrap().get("x-thing"), Some("yes"));
        assert_eq!(sink.body(), b"hello");
    }

    #[test]
    fn status_change_after_write_is_ignored() {
        let mut state = bound_state();
        state.write_str("body").unwrap();
        state.set_status(StatusCode::NotFound);
        assert_eq!(state.status(), StatusCode::Ok);
    }

    #[test]
    fn finalize_is_idempotent() {
        let mut state = bound_state();
        state.set_status(StatusCode::NoContent);
        state.finalize_head().unwrap();
        state.finalize_head().unwrap();
        state.write_str("x").unwrap();
        assert_eq!(state.bytes_written(), Some(1));

        let sink = unwrap_sink(&mut state);
        // The head was accepted exactly once, with the pre-finalize status.
        assert_eq!(sink.status(), Some(StatusCode::NoContent));
    }

    #[test]
    fn wire_format() {
        let mut state = bound_state();
        state.set_status(StatusCode::Ok);
        state.write_str("pong").unwrap();

        let wire = unwrap_sink(&mut state).finish();
        let text = String::from_utf8(wire.to_vec()).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(text.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.ends_with("\r\n\r\npong"));
    }

    #[test]
    fn explicit_framing_headers_are_not_duplicated() {
        let mut state = bound_state();
        state.set_header("Connection", "close");
        state.set_header("Content-Length", "4");
        state.write_str("body").unwrap();

        let wire = unwrap_sink(&mut state).finish();
        let text = String::from_utf8(wire.to_vec()).unwrap();
        assert_eq!(text.matches("Connection:").count(), 1);
        assert_eq!(text.matches("Content-Length:").count(), 1);
        assert!(text.contains("Connection: close\r\n"));
    }

    #[test]
    fn wire_format_close_and_empty() {
        // A sink that never saw a head serializes a bare 200.
        let wire = BufferSink::new(false).finish();
        let text = String::from_utf8(wire.to_vec()).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.contains("Content-Length: 0\r\n"));
        assert!(!text.contains("Content-Type"));
    }
}

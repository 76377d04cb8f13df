//! Per-request context shared across the middleware chain.
//!
//! A [`Context`] is a cheap-to-clone handle over one in-flight request:
//! the parsed request, captured path parameters, a typed key/value scratch
//! store, the response state, and the abort flag. Handlers and middleware
//! each hold a clone; interior state lives behind a mutex so the handle can
//! cross `.await` points freely.
//!
//! Contexts are pooled by the engine. Between requests every field is reset
//! in place, so no handler ever observes a previous request's parameters,
//! keys, or abort flag.

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::Error;
use crate::http::{Request, StatusCode};
use crate::render::{Html, Json, Renderer, Text};
use crate::response::{ResponseSink, ResponseState};

/// Path parameters captured during tree matching, in match order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Params {
    pairs: Vec<(String, String)>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, name: &str, value: &str) {
        self.pairs.push((name.to_string(), value.to_string()));
    }

    pub(crate) fn clear(&mut self) {
        self.pairs.clear();
    }

    /// The value captured for `name`, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

struct ContextState {
    request: Arc<Request>,
    params: Params,
    route_path: Option<String>,
    keys: HashMap<String, Box<dyn Any + Send + Sync>>,
    response: ResponseState,
    peer_addr: Option<SocketAddr>,
    trust_proxy: bool,
}

struct ContextInner {
    aborted: AtomicBool,
    state: Mutex<ContextState>,
}

/// Handle to one in-flight request. Clones share the same request state.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// A detached context holding placeholder state, ready for [`reset`].
    ///
    /// [`reset`]: Context::reset
    pub(crate) fn idle() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                aborted: AtomicBool::new(false),
                state: Mutex::new(ContextState {
                    request: Arc::new(Request::placeholder()),
                    params: Params::new(),
                    route_path: None,
                    keys: HashMap::new(),
                    response: ResponseState::idle(),
                    peer_addr: None,
                    trust_proxy: false,
                }),
            }),
        }
    }

    /// Rebinds this context to a new request, clearing all per-request state.
    pub(crate) fn reset(
        &self,
        request: Request,
        sink: Box<dyn ResponseSink>,
        peer_addr: Option<SocketAddr>,
        trust_proxy: bool,
    ) {
        self.inner.aborted.store(false, Ordering::Relaxed);
        let mut state = self.inner.state.lock();
        state.request = Arc::new(request);
        state.params.clear();
        state.route_path = None;
        state.keys.clear();
        state.response.reset(sink);
        state.peer_addr = peer_addr;
        state.trust_proxy = trust_proxy;
    }

    /// `true` when this handle is the only one alive, meaning the request
    /// that owned it has fully unwound and the context may be pooled.
    pub(crate) fn is_unshared(&self) -> bool {
        Arc::strong_count(&self.inner) == 1
    }

    // ---- request access -------------------------------------------------

    /// The request being served. Cheap to clone and hold across awaits.
    pub fn request(&self) -> Arc<Request> {
        self.inner.state.lock().request.clone()
    }

    /// A path parameter captured by the route pattern, e.g. `id` for `/user/:id`.
    pub fn param(&self, name: &str) -> Option<String> {
        self.inner.state.lock().params.get(name).map(str::to_string)
    }

    /// The registered pattern this request matched, e.g. `/user/:id`.
    pub fn route_path(&self) -> Option<String> {
        self.inner.state.lock().route_path.clone()
    }

    /// The first value for a query-string key.
    pub fn query(&self, name: &str) -> Option<String> {
        self.inner
            .state
            .lock()
            .request
            .query_param(name)
            .map(str::to_string)
    }

    /// The peer's claimed client address.
    ///
    /// When proxy trust is enabled on the engine, `X-Forwarded-For` (first
    /// entry) and `X-Real-IP` are consulted before falling back to the
    /// socket peer address.
    pub fn client_ip(&self) -> Option<IpAddr> {
        let state = self.inner.state.lock();
        if state.trust_proxy {
            let forwarded = state
                .request
                .headers()
                .get("x-forwarded-for")
                .and_then(|v| v.split(',').next())
                .and_then(|v| v.trim().parse().ok());
            if forwarded.is_some() {
                return forwarded;
            }
            let real = state
                .request
                .headers()
                .get("x-real-ip")
                .and_then(|v| v.trim().parse().ok());
            if real.is_some() {
                return real;
            }
        }
        state.peer_addr.map(|a| a.ip())
    }

    // ---- scratch store --------------------------------------------------

    /// Stores a value for later middleware/handlers in this request.
    pub fn set<T: Send + Sync + 'static>(&self, key: impl Into<String>, value: T) {
        self.inner
            .state
            .lock()
            .keys
            .insert(key.into(), Box::new(value));
    }

    /// Retrieves a value stored with [`set`](Context::set).
    pub fn get<T: Clone + Send + Sync + 'static>(&self, key: &str) -> Option<T> {
        self.inner
            .state
            .lock()
            .keys
            .get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    // ---- abort ----------------------------------------------------------

    /// Halts the middleware chain: pending middleware and the handler are
    /// skipped, but response finalization still runs.
    pub fn abort(&self) {
        self.inner.aborted.store(true, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::Relaxed)
    }

    /// Sets a status and aborts in one step.
    pub fn abort_with_status(&self, status: StatusCode) {
        self.set_status(status);
        self.abort();
    }

    // ---- response -------------------------------------------------------

    /// Sets the response status. Ignored (with a warning) once the head has
    /// been written.
    pub fn set_status(&self, status: StatusCode) {
        self.inner.state.lock().response.set_status(status);
    }

    pub fn response_status(&self) -> StatusCode {
        self.inner.state.lock().response.status()
    }

    /// Replaces a response header.
    pub fn set_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.state.lock().response.set_header(name, value);
    }

    /// Appends a response header without replacing existing values.
    pub fn append_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.state.lock().response.append_header(name, value);
    }

    /// `true` once the status line and headers have been flushed.
    pub fn written(&self) -> bool {
        self.inner.state.lock().response.written()
    }

    /// Body bytes written so far; `None` until the head is flushed.
    pub fn bytes_written(&self) -> Option<usize> {
        self.inner.state.lock().response.bytes_written()
    }

    /// Writes raw body bytes, flushing the head first if needed.
    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        self.inner.state.lock().response.write(data)
    }

    /// Writes a string body, flushing the head first if needed.
    pub fn write_str(&self, s: &str) -> io::Result<usize> {
        self.inner.state.lock().response.write_str(s)
    }

    /// Renders a response body through a [`Renderer`], setting the status
    /// and a content type (unless one was already set).
    pub fn render<R: Renderer>(&self, status: StatusCode, renderer: R) -> Result<(), Error> {
        let mut state = self.inner.state.lock();
        state.response.set_status(status);
        if !state.response.headers().contains("content-type") {
            state
                .response
                .set_header("Content-Type", renderer.content_type());
        }
        renderer.render(&mut state.response)
    }

    /// Sends a plain-text response.
    pub fn string(&self, status: StatusCode, body: impl Into<String>) -> Result<(), Error> {
        self.render(status, Text(body.into()))
    }

    /// Sends an HTML response.
    pub fn html(&self, status: StatusCode, body: impl Into<String>) -> Result<(), Error> {
        self.render(status, Html(body.into()))
    }

    /// Serializes `value` as a JSON response.
    pub fn json<T: Serialize>(&self, status: StatusCode, value: &T) -> Result<(), Error> {
        self.render(status, Json(value))
    }

    /// Sends a redirect to `location` and flushes the head immediately.
    pub fn redirect(&self, status: StatusCode, location: &str) -> io::Result<()> {
        let mut state = self.inner.state.lock();
        state.response.set_status(status);
        state.response.set_header("Location", location);
        state.response.finalize_head()
    }

    /// Flushes the head if nothing has been written yet. Idempotent.
    pub(crate) fn finalize(&self) -> io::Result<()> {
        self.inner.state.lock().response.finalize_head()
    }

    pub(crate) fn take_sink(&self) -> Option<Box<dyn ResponseSink>> {
        self.inner.state.lock().response.take_sink()
    }

    // ---- param buffer pooling, used by the dispatcher -------------------

    pub(crate) fn take_params(&self) -> Params {
        std::mem::take(&mut self.inner.state.lock().params)
    }

    pub(crate) fn put_params(&self, params: Params, route_path: Option<String>) {
        let mut state = self.inner.state.lock();
        state.params = params;
        state.route_path = route_path;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::BufferSink;

    fn ctx_for(raw: &[u8]) -> Context {
        let (request, _) = Request::parse(raw).unwrap();
        let ctx = Context::idle();
        ctx.reset(request, Box::new(BufferSink::new(true)), None, false);
        ctx
    }

    #[test]
    fn scratch_store_round_trip() {
        let ctx = ctx_for(b"GET / HTTP/1.1\r\n\r\n");
        ctx.set("user_id", 42u64);
        assert_eq!(ctx.get::<u64>("user_id"), Some(42));
        assert_eq!(ctx.get::<String>("user_id"), None);
        assert_eq!(ctx.get::<u64>("missing"), None);
    }

    #[test]
    fn abort_flag_visible_across_clones() {
        let ctx = ctx_for(b"GET / HTTP/1.1\r\n\r\n");
        let other = ctx.clone();
        other.abort();
        assert!(ctx.is_aborted());
    }

    #[test]
    fn reset_clears_previous_request_state() {
        let ctx = ctx_for(b"GET /a HTTP/1.1\r\n\r\n");
        ctx.set("left", "over");
        ctx.abort();
        let mut params = ctx.take_params();
        params.push("id", "1");
        ctx.put_params(params, Some("/a/:id".to_string()));

        let (request, _) = Request::parse(b"GET /b HTTP/1.1\r\n\r\n").unwrap();
        ctx.reset(request, Box::new(BufferSink::new(true)), None, false);

        assert!(!ctx.is_aborted());
        assert_eq!(ctx.get::<&str>("left"), None);
        assert_eq!(ctx.param("id"), None);
        assert_eq!(ctx.route_path(), None);
        assert!(!ctx.written());
    }

    #[test]
    fn client_ip_respects_proxy_trust() {
        let raw = b"GET / HTTP/1.1\r\nX-Forwarded-For: 10.1.2.3, 172.16.0.1\r\n\r\n";
        let (request, _) = Request::parse(raw).unwrap();
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        let ctx = Context::idle();
        ctx.reset(request, Box::new(BufferSink::new(true)), Some(peer), false);
        assert_eq!(ctx.client_ip(), Some("127.0.0.1".parse().unwrap()));

        let (request, _) = Request::parse(raw).unwrap();
        ctx.reset(request, Box::new(BufferSink::new(true)), Some(peer), true);
        assert_eq!(ctx.client_ip(), Some("10.1.2.3".parse().unwrap()));
    }

    #[test]
    fn unshared_tracks_clone_count() {
        let ctx = ctx_for(b"GET / HTTP/1.1\r\n\r\n");
        assert!(ctx.is_unshared());
        let clone = ctx.clone();
        assert!(!ctx.is_unshared());
        drop(clone);
        assert!(ctx.is_unshared());
    }
}

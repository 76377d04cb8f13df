//! Bundled middleware: request logging, request IDs, and panic recovery.

use std::any::Any;
use std::collections::hash_map::RandomState;
use std::future::Future;
use std::hash::{BuildHasher, Hasher};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{self, Poll};
use std::time::Instant;

use crate::context::Context;
use crate::http::StatusCode;
use crate::middleware::{BoxFuture, Middleware, Next};
use crate::render::escape_html;

/// Logs one line per request with method, path, status, and duration.
#[derive(Debug, Default)]
pub struct Logger;

impl Middleware for Logger {
    fn handle(&self, ctx: Context, next: Next) -> BoxFuture<()> {
        Box::pin(async move {
            let request = ctx.request();
            let method = request.method().to_string();
            let path = request.path().to_string();
            let start = Instant::now();

            next.run(ctx.clone()).await;

            let status = ctx.response_status();
            tracing::info!(
                method = %method,
                path = %path,
                status = status.as_u16(),
                elapsed = ?start.elapsed(),
                "request"
            );
        })
    }
}

/// Tags each request with a unique ID, stored under the `request_id`
/// context key and echoed in the `X-Request-ID` response header.
///
/// An inbound `X-Request-ID` header is honored as-is, so IDs survive proxy
/// hops. Generated IDs combine a random per-instance prefix with an atomic
/// counter; no lock is taken on the hot path.
pub struct RequestId {
    prefix: String,
    counter: AtomicU64,
}

/// Context key under which [`RequestId`] stores the ID.
pub const REQUEST_ID_KEY: &str = "request_id";

impl RequestId {
    pub fn new() -> Self {
        let seed = RandomState::new().build_hasher().finish();
        Self {
            prefix: format!("{:08x}", seed as u32),
            counter: AtomicU64::new(0),
        }
    }

    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{n}", self.prefix)
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl Middleware for RequestId {
    fn handle(&self, ctx: Context, next: Next) -> BoxFuture<()> {
        let id = match ctx.request().headers().get("x-request-id") {
            Some(inbound) => inbound.to_string(),
            None => self.next_id(),
        };
        Box::pin(async move {
            ctx.set(REQUEST_ID_KEY, id.clone());
            ctx.set_header("X-Request-ID", id);
            next.run(ctx).await;
        })
    }
}

/// Converts panics from downstream middleware and handlers into 500
/// responses instead of letting them tear down the connection task.
///
/// The dispatcher itself never recovers panics; install this at the root
/// for production robustness. Panic details are hidden from the response
/// body unless [`expose_detail`](Recovery::expose_detail) is enabled.
#[derive(Debug, Default)]
pub struct Recovery {
    expose_detail: bool,
}

impl Recovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Includes the panic message in the rendered 500 page. Meant for
    /// development; leaks internals if enabled in production.
    pub fn expose_detail(mut self, expose: bool) -> Self {
        self.expose_detail = expose;
        self
    }
}

impl Middleware for Recovery {
    fn handle(&self, ctx: Context, next: Next) -> BoxFuture<()> {
        let expose = self.expose_detail;
        Box::pin(async move {
            let guarded = CatchPanic {
                inner: Box::pin(next.run(ctx.clone())),
            };
            if let Err(payload) = guarded.await {
                let detail = panic_message(payload.as_ref());
                tracing::error!(detail = %detail, "handler panicked");
                ctx.abort();
                if !ctx.written() {
                    let body = if expose {
                        format!(
                            "<html><head><title>500 Internal Server Error</title></head>\
                             <body><h1>500 Internal Server Error</h1><pre>{}</pre></body></html>",
                            escape_html(&detail)
                        )
                    } else {
                        "<html><head><title>500 Internal Server Error</title></head>\
                         <body><h1>500 Internal Server Error</h1></body></html>"
                            .to_string()
                    };
                    let _ = ctx.html(StatusCode::InternalServerError, body);
                }
            }
        })
    }
}

/// Future adapter that traps panics raised inside the wrapped future's poll.
struct CatchPanic {
    inner: BoxFuture<()>,
}

impl Future for CatchPanic {
    type Output = Result<(), Box<dyn Any + Send>>;

    fn poll(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        // `inner` is a boxed future, so `Self` is `Unpin`.
        let this = self.get_mut();
        match catch_unwind(AssertUnwindSafe(|| this.inner.as_mut().poll(cx))) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(())) => Poll::Ready(Ok(())),
            Err(payload) => Poll::Ready(Err(payload)),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Request;
    use crate::middleware::{compose, from_middleware};
    use crate::response::BufferSink;
    use std::sync::Arc;

    fn test_ctx() -> Context {
        let (request, _) = Request::parse(b"GET /panic HTTP/1.1\r\n\r\n").unwrap();
        let ctx = Context::idle();
        ctx.reset(request, Box::new(BufferSink::new(true)), None, false);
        ctx
    }

    #[tokio::test]
    async fn recovery_renders_500_on_panic() {
        let chain = compose(vec![
            from_middleware(Arc::new(Recovery::new())),
            crate::middleware::from_fn(|_ctx: Context, _next: Next| async move {
                panic!("boom");
            }),
        ])
        .unwrap();

        let ctx = test_ctx();
        Next::new(chain).run(ctx.clone()).await;

        assert!(ctx.is_aborted());
        assert_eq!(ctx.response_status(), StatusCode::InternalServerError);
        assert!(ctx.written());
    }

    #[tokio::test]
    async fn recovery_leaves_written_responses_alone() {
        let chain = compose(vec![
            from_middleware(Arc::new(Recovery::new())),
            crate::middleware::from_fn(|ctx: Context, _next: Next| async move {
                ctx.string(StatusCode::Ok, "sent").unwrap();
                panic!("after write");
            }),
        ])
        .unwrap();

        let ctx = test_ctx();
        Next::new(chain).run(ctx.clone()).await;

        // The 200 already on the wire is preserved.
        assert_eq!(ctx.response_status(), StatusCode::Ok);
    }

    #[tokio::test]
    async fn request_id_honors_inbound_header() {
        let (request, _) =
            Request::parse(b"GET / HTTP/1.1\r\nX-Request-ID: upstream-7\r\n\r\n").unwrap();
        let ctx = Context::idle();
        ctx.reset(request, Box::new(BufferSink::new(true)), None, false);

        let chain = compose(vec![from_middleware(Arc::new(RequestId::new()))]).unwrap();
        Next::new(chain).run(ctx.clone()).await;

        assert_eq!(
            ctx.get::<String>(REQUEST_ID_KEY).as_deref(),
            Some("upstream-7")
        );
    }

    #[tokio::test]
    async fn request_id_generates_unique_ids() {
        let rid = RequestId::new();
        let a = rid.next_id();
        let b = rid.next_id();
        assert_ne!(a, b);
        assert!(a.ends_with("-1"));
        assert!(b.ends_with("-2"));
    }
}

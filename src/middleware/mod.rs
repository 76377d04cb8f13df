//! Middleware chain composition.
//!
//! A chain is a precomputed `Arc<[ChainFn]>` slice; [`Next`] is a cursor
//! into it. Each middleware receives the context and the cursor, does its
//! "before" work, and calls [`Next::run`] to hand off downstream; code after
//! that call is its "after" work and runs as the chain unwinds. Not calling
//! `run` (or calling [`Context::abort`]) stops the chain, and `run` checks
//! the abort flag before every hop so an abort set anywhere halts both the
//! remaining middleware and the terminal handler.
//!
//! Chains are composed once at registration, not per request.
//!
//! [`Context::abort`]: crate::context::Context::abort

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::Context;

pub mod builtin;

/// Boxed future returned by middleware and handlers.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// One link in a composed chain.
pub type ChainFn = Arc<dyn Fn(Context, Next) -> BoxFuture<()> + Send + Sync>;

/// A precomputed, immutable middleware chain.
pub(crate) type Chain = Arc<[ChainFn]>;

/// The terminal continuation run when the chain is exhausted.
pub(crate) type Terminal = Arc<dyn Fn(Context) -> BoxFuture<()> + Send + Sync>;

/// Cursor over a composed chain. Consumed by [`run`](Next::run).
pub struct Next {
    chain: Chain,
    index: usize,
    terminal: Option<Terminal>,
}

impl Next {
    pub(crate) fn new(chain: Chain) -> Self {
        Self {
            chain,
            index: 0,
            terminal: None,
        }
    }

    pub(crate) fn with_terminal(chain: Chain, terminal: Terminal) -> Self {
        Self {
            chain,
            index: 0,
            terminal: Some(terminal),
        }
    }

    /// Runs the remainder of the chain, then the terminal continuation.
    ///
    /// Skipped entirely when the context has been aborted, which is how
    /// `abort` halts downstream middleware without unwinding through an
    /// error path.
    pub async fn run(mut self, ctx: Context) {
        if ctx.is_aborted() {
            return;
        }
        if self.index < self.chain.len() {
            let link = self.chain[self.index].clone();
            self.index += 1;
            link(ctx, self).await;
        } else if let Some(terminal) = self.terminal.take() {
            terminal(ctx).await;
        }
    }
}

/// Implemented by struct-style middleware such as the bundled
/// [`Logger`](builtin::Logger).
pub trait Middleware: Send + Sync + 'static {
    fn handle(&self, ctx: Context, next: Next) -> BoxFuture<()>;
}

/// Adapts a [`Middleware`] value into a chain link.
pub fn from_middleware<M: Middleware>(middleware: Arc<M>) -> ChainFn {
    Arc::new(move |ctx, next| middleware.handle(ctx, next))
}

/// Adapts an async closure into a chain link.
///
/// ```no_run
/// # use trellis::middleware::{from_fn, Next};
/// # use trellis::Context;
/// let timing = from_fn(|ctx: Context, next: Next| async move {
///     let start = std::time::Instant::now();
///     next.run(ctx).await;
///     tracing::debug!(elapsed = ?start.elapsed(), "request served");
/// });
/// ```
pub fn from_fn<F, Fut>(f: F) -> ChainFn
where
    F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |ctx, next| Box::pin(f(ctx, next)))
}

/// Freezes an ordered list of links into a chain. Empty input composes to
/// nothing, so callers can skip the chain entirely.
pub(crate) fn compose(links: Vec<ChainFn>) -> Option<Chain> {
    if links.is_empty() {
        None
    } else {
        Some(links.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Request;
    use crate::response::BufferSink;
    use parking_lot::Mutex;

    fn test_ctx() -> Context {
        let (request, _) = Request::parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let ctx = Context::idle();
        ctx.reset(request, Box::new(BufferSink::new(true)), None, false);
        ctx
    }

    fn recording(log: Arc<Mutex<Vec<String>>>, name: &'static str) -> ChainFn {
        from_fn(move |ctx: Context, next: Next| {
            let log = log.clone();
            async move {
                log.lock().push(format!("{name}-before"));
                next.run(ctx).await;
                log.lock().push(format!("{name}-after"));
            }
        })
    }

    #[tokio::test]
    async fn chain_runs_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = compose(vec![
            recording(log.clone(), "m1"),
            recording(log.clone(), "m2"),
        ])
        .unwrap();

        let terminal_log = log.clone();
        let terminal: Terminal = Arc::new(move |_ctx| {
            let log = terminal_log.clone();
            Box::pin(async move {
                log.lock().push("handler".to_string());
            })
        });

        Next::with_terminal(chain, terminal).run(test_ctx()).await;

        assert_eq!(
            *log.lock(),
            vec!["m1-before", "m2-before", "handler", "m2-after", "m1-after"]
        );
    }

    #[tokio::test]
    async fn abort_skips_downstream_but_unwinds_upstream() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let aborting_log = log.clone();
        let aborting = from_fn(move |ctx: Context, next: Next| {
            let log = aborting_log.clone();
            async move {
                log.lock().push("abort".to_string());
                ctx.abort();
                next.run(ctx).await;
                log.lock().push("abort-after".to_string());
            }
        });

        let chain = compose(vec![
            recording(log.clone(), "m1"),
            aborting,
            recording(log.clone(), "m3"),
        ])
        .unwrap();

        let terminal_log = log.clone();
        let terminal: Terminal = Arc::new(move |_ctx| {
            let log = terminal_log.clone();
            Box::pin(async move {
                log.lock().push("handler".to_string());
            })
        });

        Next::with_terminal(chain, terminal).run(test_ctx()).await;

        // m3 and the handler never ran; upstream after-code still did.
        assert_eq!(
            *log.lock(),
            vec!["m1-before", "abort", "abort-after", "m1-after"]
        );
    }

    #[tokio::test]
    async fn not_calling_next_stops_the_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dropping_log = log.clone();
        let dropping = from_fn(move |_ctx: Context, _next: Next| {
            let log = dropping_log.clone();
            async move {
                log.lock().push("gate".to_string());
            }
        });

        let chain = compose(vec![dropping, recording(log.clone(), "m2")]).unwrap();
        Next::new(chain).run(test_ctx()).await;

        assert_eq!(*log.lock(), vec!["gate"]);
    }

    #[test]
    fn empty_compose_is_none() {
        assert!(compose(Vec::new()).is_none());
    }
}

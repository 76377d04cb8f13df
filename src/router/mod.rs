//! Route records and the registry that owns them.
//!
//! The registry keeps every registered path twice: in a flat map for exact
//! lookups (middleware inheritance walks, mount points) and in the radix
//! tree for structural request matching. The two are updated together on
//! every registration.
//!
//! Chains are flattened eagerly: whenever a handler or middleware is added,
//! every route recomputes its composed middleware (ancestor mount-point
//! middleware from root to leaf, then its own) and a full per-method
//! invocation chain ending in the adapted handler. Request dispatch then
//! just clones one `Arc` slice and runs it.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::context::{Context, Params};
use crate::engine::{Hooks, Mode, emit_error};
use crate::error::Error;
use crate::middleware::{BoxFuture, Chain, ChainFn, compose};
use crate::tree::PathTree;

/// Synthetic method key matching any verb without its own handler.
pub(crate) const ANY: &str = "ANY";

/// Type-erased final handler.
pub type HandlerFinal = Arc<dyn Fn(Context) -> BoxFuture<Result<(), Error>> + Send + Sync>;

/// Anything registerable as a route handler. Blanket-implemented for async
/// functions and closures of the shape `Fn(Context) -> Future<Result>`.
pub trait IntoHandler: Send + Sync + 'static {
    fn call(&self, ctx: Context) -> BoxFuture<Result<(), Error>>;
}

impl<F, Fut> IntoHandler for F
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    fn call(&self, ctx: Context) -> BoxFuture<Result<(), Error>> {
        Box::pin(self(ctx))
    }
}

pub(crate) fn erase_handler<H: IntoHandler>(handler: H) -> HandlerFinal {
    let handler = Arc::new(handler);
    Arc::new(move |ctx| handler.call(ctx))
}

/// One registered path: its method table, its own middleware, and the
/// flattened chains computed from both.
pub(crate) struct Route {
    path: String,
    /// Registration-ordered `(method, handler)` pairs; methods are unique.
    handlers: Vec<(String, HandlerFinal)>,
    middlewares: Vec<ChainFn>,
    /// Ancestor middleware plus own, frozen. `None` when empty.
    composed: Option<Chain>,
    /// Per-method chains ending in the adapted handler.
    flattened: HashMap<String, Chain>,
}

impl Route {
    fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            handlers: Vec::new(),
            middlewares: Vec::new(),
            composed: None,
            flattened: HashMap::new(),
        }
    }

    /// The flattened chain for a verb, falling back to `ANY`.
    pub(crate) fn chain_for(&self, method: &str) -> Option<Chain> {
        self.flattened
            .get(method)
            .or_else(|| self.flattened.get(ANY))
            .cloned()
    }

    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    /// The route's composed middleware (inherited plus own), if any.
    pub(crate) fn composed(&self) -> Option<Chain> {
        self.composed.clone()
    }
}

/// Owns all routes. Wrapped in a `RwLock` by the engine: requests take read
/// locks, registration takes the write lock and reflattens before releasing.
pub(crate) struct Registry {
    routes: HashMap<String, Route>,
    tree: PathTree,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            routes: HashMap::new(),
            tree: PathTree::new(),
        }
    }

    /// The route record for `path`, created (in map and tree) if missing.
    fn get_or_create(&mut self, path: &str) -> &mut Route {
        match self.routes.entry(path.to_string()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                self.tree.add_route(path);
                e.insert(Route::new(path))
            }
        }
    }

    /// Registers a handler. A second registration for the same verb on the
    /// same path replaces the first.
    pub(crate) fn add_handler(&mut self, path: &str, method: &str, handler: HandlerFinal) {
        let route = self.get_or_create(path);
        match route.handlers.iter_mut().find(|(m, _)| m == method) {
            Some((_, existing)) => *existing = handler,
            None => route.handlers.push((method.to_string(), handler)),
        }
    }

    /// Appends middleware to a path, creating a mount point if no handler
    /// exists there yet.
    pub(crate) fn add_middleware(&mut self, path: &str, link: ChainFn) {
        self.get_or_create(path).middlewares.push(link);
    }

    /// Exact-path lookup in the flat map, without creation.
    fn find(&self, path: &str) -> Option<&Route> {
        self.routes.get(path)
    }

    /// Structural lookup. Captured parameters are appended to `params`;
    /// on a miss the caller should discard them.
    pub(crate) fn resolve(&self, path: &str, params: &mut Params) -> (Option<&Route>, bool) {
        let (pattern, tsr) = self.tree.get_value(path, params);
        (pattern.and_then(|p| self.find(p)), tsr)
    }

    /// The nearest composed middleware chain at or above `path`.
    ///
    /// Used when no route matched: a mount point's middleware (logging,
    /// auth) still runs ahead of the not-found terminal. Empty chains are
    /// skipped so a bare ancestor route doesn't shadow a grandparent that
    /// actually carries middleware.
    pub(crate) fn mix_composed(&self, path: &str) -> Option<Chain> {
        let mut current = path.to_string();
        loop {
            if let Some(chain) = self.find(&current).and_then(|r| r.composed.clone()) {
                return Some(chain);
            }
            if !current.ends_with('/') {
                let slashed = format!("{current}/");
                if let Some(chain) = self.find(&slashed).and_then(|r| r.composed.clone()) {
                    return Some(chain);
                }
            }
            if current == "/" {
                return None;
            }
            let trimmed = current.trim_end_matches('/');
            current = match trimmed.rfind('/') {
                Some(0) => "/".to_string(),
                Some(i) => trimmed[..i].to_string(),
                None => return None,
            };
        }
    }

    /// Recomputes every route's composed and per-method chains.
    ///
    /// Runs under the registry write lock after any mutation. Middleware
    /// inheritance makes one route's flattened chains depend on its
    /// ancestors, so a targeted recompute would have to chase descendants
    /// anyway; the registry is small and writes are rare.
    pub(crate) fn reflatten_all(&mut self, hooks: &Arc<RwLock<Hooks>>, mode: Mode) {
        let mut inherited: HashMap<String, Vec<ChainFn>> = HashMap::new();
        for path in self.routes.keys() {
            inherited.insert(path.clone(), self.inherited_links(path));
        }

        for (path, links) in inherited {
            if let Some(route) = self.routes.get_mut(&path) {
                route.composed = compose(links);
                route.flattened = route
                    .handlers
                    .iter()
                    .map(|(method, handler)| {
                        let mut full: Vec<ChainFn> = route
                            .composed
                            .as_ref()
                            .map(|c| c.to_vec())
                            .unwrap_or_default();
                        full.push(adapt_final(handler.clone(), hooks.clone(), mode));
                        (method.clone(), Chain::from(full))
                    })
                    .collect();
            }
        }
    }

    /// Middleware links inherited by `path`: every ancestor prefix from the
    /// root down (probing both `/x` and `/x/` spellings), then the route's
    /// own, in registration order within each level.
    fn inherited_links(&self, path: &str) -> Vec<ChainFn> {
        let mut links = Vec::new();
        let mut extend_from = |p: &str| {
            if let Some(route) = self.find(p) {
                links.extend(route.middlewares.iter().cloned());
            }
        };

        if path != "/" {
            extend_from("/");
        }
        for (i, b) in path.bytes().enumerate() {
            if b == b'/' && i > 0 {
                let bare = &path[..i];
                if bare != path {
                    extend_from(bare);
                }
                let slashed = &path[..=i];
                if slashed != path {
                    extend_from(slashed);
                }
            }
        }
        extend_from(path);
        links
    }
}

/// Wraps a final handler as the last chain link. The cursor it receives is
/// already exhausted, so `next` is dropped unused; handler errors are routed
/// to the error hook (or the default 500 page) right here, at the innermost
/// point of the chain, so upstream middleware after-code still unwinds
/// normally.
fn adapt_final(handler: HandlerFinal, hooks: Arc<RwLock<Hooks>>, mode: Mode) -> ChainFn {
    Arc::new(move |ctx, _next| {
        let handler = handler.clone();
        let hooks = hooks.clone();
        Box::pin(async move {
            if let Err(err) = handler(ctx.clone()).await {
                emit_error(&ctx, err, &hooks, mode).await;
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Request, StatusCode};
    use crate::middleware::{Next, from_fn};
    use crate::response::BufferSink;
    use parking_lot::Mutex;

    fn test_ctx() -> Context {
        let (request, _) = Request::parse(b"GET /v1/x HTTP/1.1\r\n\r\n").unwrap();
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

    fn noop_handler() -> HandlerFinal {
        erase_handler(|_ctx: Context| async move { Ok(()) })
    }

    fn hooks() -> Arc<RwLock<Hooks>> {
        Arc::new(RwLock::new(Hooks::default()))
    }

    #[tokio::test]
    async fn ancestor_middleware_wraps_leaf_middleware() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks = hooks();
        let mut registry = Registry::new();

        registry.add_middleware("/", recording(log.clone(), "root"));
        registry.add_middleware("/v1", recording(log.clone(), "v1"));
        let marking_log = log.clone();
        registry.add_handler(
            "/v1",
            "GET",
            erase_handler(move |_ctx: Context| {
                let log = marking_log.clone();
                async move {
                    log.lock().push("handler".to_string());
                    Ok(())
                }
            }),
        );
        registry.reflatten_all(&hooks, Mode::Release);

        let mut params = Params::new();
        let (route, _) = registry.resolve("/v1", &mut params);
        let chain = route.unwrap().chain_for("GET").unwrap();
        Next::new(chain).run(test_ctx()).await;

        assert_eq!(
            *log.lock(),
            vec![
                "root-before",
                "v1-before",
                "handler",
                "v1-after",
                "root-after"
            ]
        );
    }

    #[tokio::test]
    async fn any_handler_is_a_fallback_not_an_override() {
        let hooks = hooks();
        let mut registry = Registry::new();
        let hits = Arc::new(Mutex::new(Vec::new()));

        for method in ["GET", ANY] {
            let hits = hits.clone();
            let tag = method.to_string();
            registry.add_handler(
                "/thing",
                method,
                erase_handler(move |_ctx: Context| {
                    let hits = hits.clone();
                    let tag = tag.clone();
                    async move {
                        hits.lock().push(tag);
                        Ok(())
                    }
                }),
            );
        }
        registry.reflatten_all(&hooks, Mode::Release);

        let mut params = Params::new();
        let (route, _) = registry.resolve("/thing", &mut params);
        let route = route.unwrap();

        Next::new(route.chain_for("GET").unwrap()).run(test_ctx()).await;
        Next::new(route.chain_for("POST").unwrap()).run(test_ctx()).await;
        assert_eq!(*hits.lock(), vec!["GET", "ANY"]);
        assert!(route.chain_for("DELETE").is_some());
    }

    #[test]
    fn same_verb_registration_replaces() {
        let hooks = hooks();
        let mut registry = Registry::new();
        registry.add_handler("/a", "GET", noop_handler());
        registry.add_handler("/a", "GET", noop_handler());
        registry.reflatten_all(&hooks, Mode::Release);

        let mut params = Params::new();
        let (route, _) = registry.resolve("/a", &mut params);
        assert_eq!(route.unwrap().handlers.len(), 1);
    }

    #[test]
    fn mix_composed_walks_past_empty_ancestors() {
        let hooks = hooks();
        let mut registry = Registry::new();
        registry.add_middleware("/api", from_fn(|ctx, next: Next| next.run(ctx)));
        // A mount point with no middleware of its own sits in between.
        registry.add_handler("/api/v2/users", "GET", noop_handler());
        registry.add_handler("/api/v2", "GET", noop_handler());
        registry.reflatten_all(&hooks, Mode::Release);

        // "/api/v2" has a composed chain (inherits from /api), found first.
        assert!(registry.mix_composed("/api/v2/ghost").is_some());
        // Nothing registered above "/other".
        assert!(registry.mix_composed("/other/ghost").is_none());
    }

    #[tokio::test]
    async fn handler_error_renders_default_500() {
        let hooks = hooks();
        let mut registry = Registry::new();
        registry.add_handler(
            "/fail",
            "GET",
            erase_handler(|_ctx: Context| async move {
                Err(Error::message("database unavailable"))
            }),
        );
        registry.reflatten_all(&hooks, Mode::Release);

        let mut params = Params::new();
        let (route, _) = registry.resolve("/fail", &mut params);
        let chain = route.unwrap().chain_for("GET").unwrap();

        let ctx = test_ctx();
        Next::new(chain).run(ctx.clone()).await;
        assert_eq!(ctx.response_status(), StatusCode::InternalServerError);
        assert!(ctx.written());
    }
}

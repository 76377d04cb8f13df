//! The engine: route registration surface and per-request dispatch.
//!
//! Registration (verb methods, [`Engine::use_fn`], [`Engine::scope`]) takes
//! the registry write lock, mutates, and reflattens every route's chain
//! before releasing. Dispatch takes a read lock only long enough to resolve
//! the path to a precomputed chain, then runs the chain without holding any
//! lock, so slow handlers never serialize unrelated requests.
//!
//! Contexts are pooled. A context is returned to the pool only when the
//! request dropped every clone of its handle; anything still referenced by
//! a leaked clone is simply not reused.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::context::Context;
use crate::error::Error;
use crate::http::{Method, Request, StatusCode};
use crate::middleware::{
    BoxFuture, ChainFn, Middleware, Next, Terminal, from_fn, from_middleware,
};
use crate::render::escape_html;
use crate::response::ResponseSink;
use crate::router::{ANY, HandlerFinal, IntoHandler, Registry, erase_handler};

/// Contexts kept around between requests.
const POOL_LIMIT: usize = 256;

/// Operating mode, chosen at construction.
///
/// `Debug` includes error details in default 500 pages; `Release` replaces
/// them with a generic message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Debug,
    Release,
}

pub(crate) type HookFn = Arc<dyn Fn(Context) -> BoxFuture<()> + Send + Sync>;
pub(crate) type ErrorHookFn = Arc<dyn Fn(Context, Error) -> BoxFuture<()> + Send + Sync>;

/// Replaceable lifecycle collaborators. Shared with flattened chains
/// through an `Arc<RwLock<_>>`, so swapping a hook takes effect without
/// reflattening.
#[derive(Default)]
pub(crate) struct Hooks {
    pub(crate) on_request: Option<HookFn>,
    pub(crate) on_response: Option<HookFn>,
    pub(crate) not_found: Option<HandlerFinal>,
    pub(crate) error: Option<ErrorHookFn>,
}

/// Routes requests through registered middleware chains to handlers.
pub struct Engine {
    registry: RwLock<Registry>,
    hooks: Arc<RwLock<Hooks>>,
    pool: Mutex<Vec<Context>>,
    mode: Mode,
    trust_proxy: bool,
}

impl Engine {
    /// An empty engine in [`Mode::Release`].
    pub fn new() -> Self {
        Self::with_mode(Mode::Release)
    }

    pub fn with_mode(mode: Mode) -> Self {
        Self {
            registry: RwLock::new(Registry::new()),
            hooks: Arc::new(RwLock::new(Hooks::default())),
            pool: Mutex::new(Vec::new()),
            mode,
            trust_proxy: false,
        }
    }

    /// Trust `X-Forwarded-For` / `X-Real-IP` when reporting client IPs.
    /// Enable only behind a proxy that sanitizes these headers.
    pub fn trust_proxy_headers(mut self, trust: bool) -> Self {
        self.trust_proxy = trust;
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    // ---- registration ---------------------------------------------------

    /// Registers a handler for an explicit method on `path`.
    ///
    /// Panics on malformed or structurally conflicting paths; registration
    /// errors are configuration bugs and should abort startup.
    pub fn handle<H: IntoHandler>(&self, path: &str, method: Method, handler: H) {
        self.register(path, method.as_str(), erase_handler(handler));
    }

    pub fn get<H: IntoHandler>(&self, path: &str, handler: H) {
        self.handle(path, Method::Get, handler);
    }

    pub fn post<H: IntoHandler>(&self, path: &str, handler: H) {
        self.handle(path, Method::Post, handler);
    }

    pub fn put<H: IntoHandler>(&self, path: &str, handler: H) {
        self.handle(path, Method::Put, handler);
    }

    pub fn delete<H: IntoHandler>(&self, path: &str, handler: H) {
        self.handle(path, Method::Delete, handler);
    }

    pub fn patch<H: IntoHandler>(&self, path: &str, handler: H) {
        self.handle(path, Method::Patch, handler);
    }

    pub fn head<H: IntoHandler>(&self, path: &str, handler: H) {
        self.handle(path, Method::Head, handler);
    }

    pub fn options<H: IntoHandler>(&self, path: &str, handler: H) {
        self.handle(path, Method::Options, handler);
    }

    /// Registers a fallback handler matching any verb without its own.
    pub fn any<H: IntoHandler>(&self, path: &str, handler: H) {
        self.register(path, ANY, erase_handler(handler));
    }

    /// Attaches struct-style middleware to `path` and everything below it.
    pub fn use_middleware<M: Middleware>(&self, path: &str, middleware: M) {
        self.attach(path, from_middleware(Arc::new(middleware)));
    }

    /// Attaches closure middleware to `path` and everything below it.
    pub fn use_fn<F, Fut>(&self, path: &str, f: F)
    where
        F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.attach(path, from_fn(f));
    }

    /// Groups registrations under a shared path prefix.
    ///
    /// ```no_run
    /// # use trellis::{Engine, Context, StatusCode};
    /// let app = Engine::new();
    /// app.scope("/api", |api| {
    ///     api.get("/users", |ctx: Context| async move {
    ///         ctx.string(StatusCode::Ok, "[]")
    ///     });
    /// });
    /// ```
    pub fn scope(&self, base: &str, build: impl FnOnce(&Scope<'_>)) {
        let scope = Scope {
            engine: self,
            base: base.to_string(),
        };
        build(&scope);
    }

    fn register(&self, path: &str, method: &str, handler: HandlerFinal) {
        let mut registry = self.registry.write();
        registry.add_handler(path, method, handler);
        registry.reflatten_all(&self.hooks, self.mode);
    }

    fn attach(&self, path: &str, link: ChainFn) {
        let mut registry = self.registry.write();
        registry.add_middleware(path, link);
        registry.reflatten_all(&self.hooks, self.mode);
    }

    // ---- lifecycle hooks ------------------------------------------------

    /// Runs before route resolution for every request.
    pub fn on_request<F, Fut>(&self, f: F)
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.hooks.write().on_request = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
    }

    /// Runs after the chain completes, before finalization, for every request.
    pub fn on_response<F, Fut>(&self, f: F)
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.hooks.write().on_response = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
    }

    /// Replaces the default 404 page. Runs only when nothing has been
    /// written yet, so middleware output is never clobbered.
    pub fn not_found<H: IntoHandler>(&self, handler: H) {
        self.hooks.write().not_found = Some(erase_handler(handler));
    }

    /// Replaces the default 500 renderer for handler errors.
    pub fn error_handler<F, Fut>(&self, f: F)
    where
        F: Fn(Context, Error) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.hooks.write().error = Some(Arc::new(move |ctx, err| Box::pin(f(ctx, err))));
    }

    // ---- dispatch -------------------------------------------------------

    /// Serves one request against `sink`, returning the sink when done.
    pub async fn dispatch<S: ResponseSink>(&self, request: Request, sink: S) -> S {
        self.dispatch_from(request, sink, None).await
    }

    /// Like [`dispatch`](Engine::dispatch), with the socket peer address
    /// for [`Context::client_ip`].
    pub async fn dispatch_from<S: ResponseSink>(
        &self,
        request: Request,
        sink: S,
        peer_addr: Option<SocketAddr>,
    ) -> S {
        let method = request.method().clone();
        let path = request.path().to_string();
        let query = request.query_string().map(str::to_string);

        let ctx = self.acquire();
        ctx.reset(request, Box::new(sink), peer_addr, self.trust_proxy);

        let (on_request, on_response) = {
            let hooks = self.hooks.read();
            (hooks.on_request.clone(), hooks.on_response.clone())
        };

        if let Some(hook) = on_request {
            hook(ctx.clone()).await;
        }

        let resolution = self.resolve(&ctx, &path, &method, query.as_deref());

        match resolution {
            Resolution::Run { chain } => {
                Next::new(chain).run(ctx.clone()).await;
            }
            Resolution::RunThenNotFound { chain } => {
                let hooks = self.hooks.clone();
                let mode = self.mode;
                let terminal: Terminal = Arc::new(move |ctx: Context| {
                    let hooks = hooks.clone();
                    Box::pin(async move { serve_not_found(&ctx, &hooks, mode).await })
                });
                Next::with_terminal(chain, terminal).run(ctx.clone()).await;
            }
            Resolution::Redirect { location, code } => {
                if let Err(err) = ctx.redirect(code, &location) {
                    tracing::error!(error = %err, "redirect write failed");
                }
            }
            Resolution::NotFound => {
                serve_not_found(&ctx, &self.hooks, self.mode).await;
            }
        }

        if let Some(hook) = on_response {
            hook(ctx.clone()).await;
        }
        if let Err(err) = ctx.finalize() {
            tracing::error!(error = %err, "response finalization failed");
        }

        let sink = ctx
            .take_sink()
            .and_then(|s| s.into_any().downcast::<S>().ok());
        self.release(ctx);
        match sink {
            Some(sink) => *sink,
            // The sink is placed by this function and taken only here.
            None => panic!("response sink type changed during dispatch"),
        }
    }

    /// Resolves a path under the registry read lock. Returns owned data so
    /// the lock is released before any handler runs.
    fn resolve(
        &self,
        ctx: &Context,
        path: &str,
        method: &Method,
        query: Option<&str>,
    ) -> Resolution {
        let registry = self.registry.read();
        let mut params = ctx.take_params();
        params.clear();

        let (route, tsr) = registry.resolve(path, &mut params);
        match route {
            Some(route) => {
                if let Some(chain) = route.chain_for(method.as_str()) {
                    let route_path = route.path().to_string();
                    ctx.put_params(params, Some(route_path));
                    return Resolution::Run { chain };
                }
                // Matched path, wrong verb: mount-point middleware still
                // runs ahead of the not-found terminal.
                let fallback = route.composed().or_else(|| registry.mix_composed(path));
                params.clear();
                ctx.put_params(params, None);
                match fallback {
                    Some(chain) => Resolution::RunThenNotFound { chain },
                    None => Resolution::NotFound,
                }
            }
            None => {
                params.clear();
                ctx.put_params(params, None);
                if tsr && *method != Method::Connect && path != "/" {
                    let mut location = toggle_trailing_slash(path);
                    if let Some(q) = query {
                        location.push('?');
                        location.push_str(q);
                    }
                    return Resolution::Redirect {
                        location,
                        code: StatusCode::redirect_for(method),
                    };
                }
                match registry.mix_composed(path) {
                    Some(chain) => Resolution::RunThenNotFound { chain },
                    None => Resolution::NotFound,
                }
            }
        }
    }

    fn acquire(&self) -> Context {
        self.pool.lock().pop().unwrap_or_else(Context::idle)
    }

    fn release(&self, ctx: Context) {
        if ctx.is_unshared() {
            let mut pool = self.pool.lock();
            if pool.len() < POOL_LIMIT {
                pool.push(ctx);
            }
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

enum Resolution {
    Run { chain: crate::middleware::Chain },
    RunThenNotFound { chain: crate::middleware::Chain },
    Redirect { location: String, code: StatusCode },
    NotFound,
}

/// Registration surface scoped under a path prefix. Created by
/// [`Engine::scope`]; nests.
pub struct Scope<'e> {
    engine: &'e Engine,
    base: String,
}

impl Scope<'_> {
    pub fn handle<H: IntoHandler>(&self, path: &str, method: Method, handler: H) {
        self.engine
            .handle(&join_paths(&self.base, path), method, handler);
    }

    pub fn get<H: IntoHandler>(&self, path: &str, handler: H) {
        self.handle(path, Method::Get, handler);
    }

    pub fn post<H: IntoHandler>(&self, path: &str, handler: H) {
        self.handle(path, Method::Post, handler);
    }

    pub fn put<H: IntoHandler>(&self, path: &str, handler: H) {
        self.handle(path, Method::Put, handler);
    }

    pub fn delete<H: IntoHandler>(&self, path: &str, handler: H) {
        self.handle(path, Method::Delete, handler);
    }

    pub fn patch<H: IntoHandler>(&self, path: &str, handler: H) {
        self.handle(path, Method::Patch, handler);
    }

    pub fn any<H: IntoHandler>(&self, path: &str, handler: H) {
        self.engine
            .any(&join_paths(&self.base, path), handler);
    }

    /// Middleware on the scope's own mount point, inherited by everything
    /// registered below it.
    pub fn use_middleware<M: Middleware>(&self, middleware: M) {
        self.engine.use_middleware(&self.base, middleware);
    }

    pub fn use_fn<F, Fut>(&self, f: F)
    where
        F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.engine.use_fn(&self.base, f);
    }

    pub fn scope(&self, base: &str, build: impl FnOnce(&Scope<'_>)) {
        self.engine.scope(&join_paths(&self.base, base), build);
    }
}

/// Joins a scope base with a relative path, preserving the relative path's
/// trailing slash.
fn join_paths(base: &str, rel: &str) -> String {
    let base = base.trim_end_matches('/');
    let rel = rel.trim_start_matches('/');
    if rel.is_empty() {
        if base.is_empty() {
            "/".to_string()
        } else {
            base.to_string()
        }
    } else {
        format!("{base}/{rel}")
    }
}

fn toggle_trailing_slash(path: &str) -> String {
    match path.strip_suffix('/') {
        Some(stripped) => stripped.to_string(),
        None => format!("{path}/"),
    }
}

/// Serves the not-found terminal state: a custom handler if one is set,
/// otherwise a minimal 404 page. Skipped entirely when a response is
/// already underway.
pub(crate) async fn serve_not_found(ctx: &Context, hooks: &Arc<RwLock<Hooks>>, mode: Mode) {
    if ctx.written() || ctx.response_status() != StatusCode::Ok {
        return;
    }
    let custom = hooks.read().not_found.clone();
    if let Some(handler) = custom {
        if let Err(err) = handler(ctx.clone()).await {
            emit_error(ctx, err, hooks, mode).await;
        }
        return;
    }
    let path = ctx.request().path().to_string();
    let body = error_page("404 Not Found", &format!("No route for '{path}'"));
    if let Err(err) = ctx.html(StatusCode::NotFound, body) {
        tracing::error!(error = %err, "404 render failed");
    }
}

/// Routes a handler error to the configured hook or the default 500 page.
pub(crate) async fn emit_error(ctx: &Context, err: Error, hooks: &Arc<RwLock<Hooks>>, mode: Mode) {
    tracing::error!(error = %err, "handler error");
    let hook = hooks.read().error.clone();
    if let Some(hook) = hook {
        hook(ctx.clone(), err).await;
        return;
    }
    if ctx.written() {
        return;
    }
    let detail = match mode {
        Mode::Debug => err.to_string(),
        Mode::Release => "Internal Server Error".to_string(),
    };
    let body = error_page("500 Internal Server Error", &detail);
    if let Err(render_err) = ctx.html(StatusCode::InternalServerError, body) {
        tracing::error!(error = %render_err, "500 render failed");
    }
}

fn error_page(title: &str, detail: &str) -> String {
    format!(
        "<html><head><title>{title}</title></head>\
         <body><h1>{title}</h1><p>{}</p></body></html>",
        escape_html(detail)
    )
}

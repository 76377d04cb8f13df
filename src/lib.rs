//! # trellis
//!
//! A tree-routed HTTP/1.1 middleware framework.
//!
//! Routes live in a compressed radix tree (`/user/:id`, `/static/*rest`),
//! middleware composes into chains flattened at registration time, and each
//! request runs against a pooled context shared by every link in its chain.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trellis::middleware::builtin::{Logger, Recovery};
//! use trellis::{Context, Engine, Server, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let app = Engine::new();
//!     app.use_middleware("/", Logger);
//!     app.use_middleware("/", Recovery::new());
//!
//!     app.get("/hello/:name", |ctx: Context| async move {
//!         let name = ctx.param("name").unwrap_or_default();
//!         ctx.string(StatusCode::Ok, format!("hello, {name}"))
//!     });
//!
//!     Server::bind("127.0.0.1:8080")
//!         .await?
//!         .serve(Arc::new(app))
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Design notes
//!
//! - Registration is a configuration phase: malformed or conflicting route
//!   patterns panic rather than erroring, so a bad table aborts startup.
//! - Chains are precomputed. A request dispatch resolves the path under a
//!   read lock, clones one `Arc` slice, and runs it lock-free.
//! - Panics in handlers are not recovered by the dispatcher; install
//!   [`middleware::builtin::Recovery`] for production use.

pub mod bind;
pub mod context;
pub mod engine;
pub mod error;
pub mod http;
pub mod middleware;
pub mod render;
pub mod response;
pub mod router;
pub mod server;

mod tree;

pub use bind::{Bind, BindError, FieldKind, Schema};
pub use context::{Context, Params};
pub use engine::{Engine, Mode, Scope};
pub use error::Error;
pub use http::{Headers, Method, Request, StatusCode};
pub use middleware::{Middleware, Next};
pub use render::{Html, Json, Raw, Renderer, Text};
pub use response::{BufferSink, ResponseSink, ResponseState};
pub use router::IntoHandler;
pub use server::{Server, ServerError};

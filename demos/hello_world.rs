//! Minimal trellis application: logging, recovery, scoped routes, and
//! query binding.
//!
//! Run with `cargo run --example hello_world`, then:
//!
//! ```sh
//! curl http://127.0.0.1:8080/hello/world
//! curl http://127.0.0.1:8080/api/search?q=trees&limit=3
//! ```

use std::sync::Arc;

use trellis::bind::{Bind, FieldKind, Schema, parse_value};
use trellis::middleware::builtin::{Logger, Recovery, RequestId};
use trellis::{Context, Engine, Server, StatusCode};

#[derive(Default, serde::Serialize)]
struct Search {
    q: String,
    limit: u32,
}

impl Bind for Search {
    fn schema() -> Schema<Self> {
        Schema::new()
            .required("q", FieldKind::Scalar, |s: &mut Self, v| {
                s.q = v.to_string();
                Ok(())
            })
            .field("limit", FieldKind::Scalar, |s: &mut Self, v| {
                s.limit = parse_value(v, "limit")?;
                Ok(())
            })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let app = Engine::new();
    app.use_middleware("/", Logger);
    app.use_middleware("/", RequestId::new());
    app.use_middleware("/", Recovery::new());

    app.get("/hello/:name", |ctx: Context| async move {
        let name = ctx.param("name").unwrap_or_default();
        ctx.string(StatusCode::Ok, format!("hello, {name}\n"))
    });

    app.scope("/api", |api| {
        api.get("/search", |ctx: Context| async move {
            match ctx.bind_query::<Search>() {
                Ok(search) => ctx.json(StatusCode::Ok, &search),
                Err(err) => ctx.string(StatusCode::BadRequest, err.to_string()),
            }
        });
    });

    Server::bind("127.0.0.1:8080")
        .await?
        .serve(Arc::new(app))
        .await?;
    Ok(())
}

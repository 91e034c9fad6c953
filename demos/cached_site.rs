//! Serves a small slow-to-render site with disk caching in front of it.
//!
//! ```text
//! RUST_LOG=rttp_diskcache=debug cargo run --example cached_site -- cache.json
//! curl -i http://127.0.0.1:8080/licenses/by/4.0/
//! ```
//!
//! The optional argument is a JSON settings file, for example
//! `{ "cache_dir": "cache", "cache_paths": "/licenses" }`. Without one the
//! cache lives in `./cache` and covers every path.

use std::time::Duration;

use rttp_diskcache::cache::{CacheConfig, CacheError, CacheMiddleware, CacheSettings};
use rttp_diskcache::context::Context;
use rttp_diskcache::middleware::{LoggerMiddleware, Pipeline};
use rttp_diskcache::{Response, Server, StatusCode};
use tracing_subscriber::EnvFilter;

async fn render(ctx: Context) -> Response {
    // Stand-in for an expensive template render.
    tokio::time::sleep(Duration::from_millis(250)).await;

    let path = ctx.request().path();
    if path.starts_with("/private") {
        return Response::new(StatusCode::Ok)
            .header("Content-Type", "text/html")
            .header("Cache-Control", "private")
            .body(format!("<h1>{path}</h1><p>Never stored.</p>"));
    }

    Response::new(StatusCode::Ok)
        .header("Content-Type", "text/html")
        .body(format!("<h1>{path}</h1><p>Rendered once.</p>"))
}

async fn load_config() -> Result<CacheConfig, CacheError> {
    let settings = match std::env::args().nth(1) {
        Some(file) => CacheSettings::from_json(&tokio::fs::read_to_string(file).await?)?,
        None => CacheSettings::from_options([("cache_dir", "cache")])?,
    };
    settings.into_config(std::env::current_dir()?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match load_config().await {
        Ok(config) => config,
        Err(e) if e.is_config() => {
            tracing::error!(error = %e, "invalid cache configuration");
            std::process::exit(2);
        }
        Err(e) => return Err(e.into()),
    };
    tracing::info!(root = %config.cache_root().display(), "cache ready");

    let pipeline = Pipeline::new(render)
        .layer(LoggerMiddleware)
        .layer(CacheMiddleware::new(config));

    let server = Server::bind("127.0.0.1:8080").await?;
    server.run(pipeline).await?;
    Ok(())
}

//! # rttp-diskcache
//!
//! Disk-backed response caching for an async HTTP/1.1 server.
//!
//! The first `200 OK` response for a request path is written to a file under
//! a cache root; later requests for that path are answered from the file
//! without running the application again. See [`cache`] for the rules.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rttp_diskcache::cache::{CacheConfig, CacheMiddleware};
//! use rttp_diskcache::middleware::{LoggerMiddleware, Pipeline};
//! use rttp_diskcache::{Response, Server, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CacheConfig::builder(".", "cache").build()?;
//!
//!     let pipeline = Pipeline::new(|_ctx| async {
//!         Response::new(StatusCode::Ok)
//!             .header("Content-Type", "text/html")
//!             .body("<h1>Hello, World!</h1>")
//!     })
//!     .layer(LoggerMiddleware)
//!     .layer(CacheMiddleware::new(config));
//!
//!     Server::bind("127.0.0.1:8080").await?.run(pipeline).await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod context;
pub mod http;
pub mod middleware;
pub mod server;

pub use cache::{CacheConfig, CacheError, CacheMiddleware};
pub use http::{Body, Headers, Method, Request, Response, StatusCode};
pub use middleware::Pipeline;
pub use server::{Server, ServerError};

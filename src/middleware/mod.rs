//! Middleware pipeline: ordered layers in front of an endpoint handler.
//!
//! A [`Pipeline`] owns an ordered list of middleware and the endpoint (the
//! wrapped application). Each middleware receives the request [`Context`]
//! and a [`Next`] cursor, and may pass the request through, answer it
//! directly, or decorate the downstream response.
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by all middleware.
//! - [`Next`]: cursor into the remaining chain; [`Next::run`] advances it.
//! - [`MiddlewareHandler`]: type-erased, cheaply-cloneable middleware function.
//! - [`Handler`]: the type-erased endpoint at the end of the chain.
//! - [`Pipeline`]: middleware stack plus endpoint, ready to serve.
//! - [`LoggerMiddleware`]: one log line per request.

use std::{future::Future, pin::Pin, sync::Arc};
use tokio::time::Instant;

use crate::{Response, context::Context};

/// Boxed future returned by every handler and middleware.
pub type BoxResponse = Pin<Box<dyn Future<Output = Response> + Send>>;

/// Type-erased endpoint handler.
pub type Handler = Arc<dyn Fn(Context) -> BoxResponse + Send + Sync + 'static>;

/// Type-erased, reference-counted middleware function.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use rttp_diskcache::{context::Context, middleware::{MiddlewareHandler, Next}};
///
/// let handler: MiddlewareHandler = Arc::new(|ctx: Context, next: Next| {
///     Box::pin(async move { next.run(ctx).await })
/// });
/// ```
pub type MiddlewareHandler = Arc<dyn Fn(Context, Next) -> BoxResponse + Send + Sync + 'static>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is consumed by [`run`](Self::run), so a middleware can forward a
/// request at most once. Once every middleware has run, the endpoint is
/// invoked.
pub struct Next {
    middlewares: Arc<[MiddlewareHandler]>,
    // Index of the middleware `run` invokes; `len` means the endpoint.
    index: usize,
    endpoint: Handler,
}

impl Next {
    /// Creates a cursor positioned at the start of `middlewares`.
    pub fn new(middlewares: Arc<[MiddlewareHandler]>, endpoint: Handler) -> Self {
        Self {
            middlewares,
            index: 0,
            endpoint,
        }
    }

    /// Invokes the next middleware, or the endpoint when none remain.
    pub async fn run(mut self, ctx: Context) -> Response {
        if self.index < self.middlewares.len() {
            let handler = Arc::clone(&self.middlewares[self.index]);
            self.index += 1;
            handler(ctx, self).await
        } else {
            (self.endpoint)(ctx).await
        }
    }
}

/// The core trait for all middleware.
///
/// # Contract
///
/// - Implementations must be `Send + Sync`; one instance serves every
///   connection task.
/// - `handle` must return a `Send` future.
/// - Shared state must not be held behind `&mut` across an `.await`.
pub trait Middleware: Send + Sync {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponse;
}

/// Middleware stack in front of an endpoint.
///
/// Layers run in the order they were added: the first layer sees the
/// request first and the response last.
///
/// # Examples
///
/// ```rust,no_run
/// use rttp_diskcache::middleware::{LoggerMiddleware, Pipeline};
/// use rttp_diskcache::{Response, StatusCode};
///
/// let pipeline = Pipeline::new(|_ctx| async { Response::new(StatusCode::Ok).body("hi") })
///     .layer(LoggerMiddleware);
/// ```
#[derive(Clone)]
pub struct Pipeline {
    middlewares: Arc<[MiddlewareHandler]>,
    endpoint: Handler,
}

impl Pipeline {
    /// Creates a pipeline with no layers around `endpoint`.
    pub fn new<H, F>(endpoint: H) -> Self
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        let endpoint: Handler = Arc::new(move |ctx: Context| -> BoxResponse { Box::pin(endpoint(ctx)) });
        Self {
            middlewares: Arc::from(Vec::new()),
            endpoint,
        }
    }

    /// Appends a middleware as the innermost layer so far.
    #[must_use]
    pub fn layer<M>(self, middleware: M) -> Self
    where
        M: Middleware + 'static,
    {
        self.layer_handler(from_middleware(Arc::new(middleware)))
    }

    #[must_use]
    pub fn layer_handler(self, handler: MiddlewareHandler) -> Self {
        let mut middlewares = self.middlewares.to_vec();
        middlewares.push(handler);
        Self {
            middlewares: Arc::from(middlewares),
            endpoint: self.endpoint,
        }
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Runs one request through every layer and the endpoint.
    pub async fn call(&self, ctx: Context) -> Response {
        Next::new(Arc::clone(&self.middlewares), Arc::clone(&self.endpoint))
            .run(ctx)
            .await
    }
}

/// Logs method, path, status, body length and duration of each request.
///
/// ```text
/// INFO request served method=GET path=/licenses status=200 bytes=5120 elapsed=412µs
/// ```
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponse {
        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.request().method().clone();
            let path = ctx.request().path().to_owned();

            let response = next.run(ctx).await;

            tracing::info!(
                method = %method,
                path = %path,
                status = response.status().as_u16(),
                bytes = response.body_len(),
                elapsed = ?start.elapsed(),
                "request served"
            );

            response
        })
    }
}

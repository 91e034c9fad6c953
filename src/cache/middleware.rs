use std::sync::Arc;

use tracing::{debug, error};

use super::key::{Eligibility, classify};
use super::lock::KeyLocks;
use super::policy::ResponsePolicy;
use super::{CacheConfig, CacheError, CacheKey, DiskStore};
use crate::context::Context;
use crate::http::{Body, StatusCode};
use crate::middleware::{BoxResponse, Middleware, Next};
use crate::Response;

/// Response caching middleware backed by the filesystem.
///
/// For a cacheable request a stored body is served directly, with status
/// `200 OK` and the configured content type; the rest of the pipeline does
/// not run. On a miss the downstream response is forwarded and, if it is a
/// storable `200 OK`, its body is written to disk on the way out. Requests
/// with a query string, or outside the configured path prefixes, pass
/// through untouched.
///
/// Stored entries never expire; remove files under the cache root to
/// invalidate them.
///
/// # Examples
///
/// ```rust,no_run
/// use rttp_diskcache::cache::{CacheConfig, CacheMiddleware};
/// use rttp_diskcache::middleware::Pipeline;
/// use rttp_diskcache::{Response, StatusCode};
///
/// # fn main() -> Result<(), rttp_diskcache::cache::CacheError> {
/// let config = CacheConfig::builder("/srv/site", "cache")
///     .cache_paths_list("/licenses")
///     .build()?;
///
/// let pipeline = Pipeline::new(|_ctx| async { Response::new(StatusCode::Ok).body("<p>hi</p>") })
///     .layer(CacheMiddleware::new(config));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct CacheMiddleware {
    shared: Arc<Shared>,
}

struct Shared {
    config: CacheConfig,
    store: DiskStore,
    policy: ResponsePolicy,
    locks: Option<KeyLocks>,
}

impl CacheMiddleware {
    pub fn new(config: CacheConfig) -> Self {
        let store = DiskStore::from_config(&config);
        let policy = ResponsePolicy::new(config.honor_cache_control());
        let locks = config.lock_misses().then(KeyLocks::new);
        Self {
            shared: Arc::new(Shared {
                config,
                store,
                policy,
                locks,
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &DiskStore {
        &self.shared.store
    }
}

impl Middleware for CacheMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponse {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            let request = ctx.request();
            let key = match classify(
                request.path(),
                request.query_string(),
                shared.config.cache_path_prefixes(),
            ) {
                Eligibility::Cacheable(key) => key,
                Eligibility::MissThrough => {
                    debug!(path = %request.path(), "cache bypassed");
                    return next.run(ctx).await;
                }
            };

            match shared.respond(&key, ctx, next).await {
                Ok(response) => response,
                Err(e) => {
                    error!(key = %key, error = %e, "cache failure");
                    Response::new(StatusCode::InternalServerError).body("Internal Server Error")
                }
            }
        })
    }
}

impl Shared {
    async fn respond(
        &self,
        key: &CacheKey,
        ctx: Context,
        next: Next,
    ) -> Result<Response, CacheError> {
        if let Some(hit) = self.serve_cached(key).await? {
            return Ok(hit);
        }

        let mut guard = match &self.locks {
            Some(locks) => {
                let guard = locks.acquire(key.as_str()).await;
                // Another request may have filled the entry while we waited.
                if let Some(hit) = self.serve_cached(key).await? {
                    return Ok(hit);
                }
                if guard.previous_rejected() {
                    // Nothing will be stored; render without holding up the queue.
                    debug!(key = %key, "previous render not stored, skipping lock");
                    None
                } else {
                    Some(guard)
                }
            }
            None => None,
        };

        debug!(key = %key, "cache miss");
        let mut response = next.run(ctx).await;

        if let Err(reason) = self.policy.check(&response) {
            debug!(key = %key, ?reason, "response not stored");
            if let Some(guard) = guard.as_mut() {
                guard.set_rejected(true);
            }
            return Ok(response);
        }

        let chunks = response.take_body().collect_chunks().await?;
        self.store.store(key, &chunks).await?;
        if let Some(guard) = guard.as_mut() {
            guard.set_rejected(false);
        }
        response.set_body(Body::from_chunks(chunks));
        Ok(response)
    }

    async fn serve_cached(&self, key: &CacheKey) -> Result<Option<Response>, CacheError> {
        if !self.store.is_cached(key).await {
            return Ok(None);
        }

        match self.store.load(key).await {
            Ok(body) => {
                debug!(key = %key, bytes = body.len(), "cache hit");
                Ok(Some(
                    Response::new(StatusCode::Ok)
                        .header("Content-Type", self.config.content_type())
                        .with_body(body),
                ))
            }
            // Removed between probe and open.
            Err(CacheError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Request;
    use crate::cache::{CacheConfigBuilder, CacheSettings};
    use crate::http::Headers;
    use crate::middleware::Pipeline;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const TESTING_CONTENT_TYPE: &str = "text/test";

    /// Body the test endpoint echoes back.
    struct Contents(&'static str);

    /// Extra response headers the test endpoint appends.
    struct ExtraHeaders(Vec<(&'static str, &'static str)>);

    /// Status the test endpoint answers with, `200 OK` when absent.
    struct Status(StatusCode);

    struct Harness {
        _dir: tempfile::TempDir,
        pipeline: Pipeline,
        calls: Arc<AtomicUsize>,
        cache: CacheMiddleware,
    }

    impl Harness {
        fn new(configure: impl FnOnce(CacheConfigBuilder) -> CacheConfigBuilder) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config = configure(CacheConfig::builder(dir.path(), "cache")).build().unwrap();
            let cache = CacheMiddleware::new(config);
            let calls = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&calls);

            let pipeline = Pipeline::new(move |ctx: Context| {
                counter.fetch_add(1, Ordering::SeqCst);
                let contents = ctx.extensions().get::<Contents>().map_or("", |c| c.0);
                let status = ctx.extensions().get::<Status>().map_or(StatusCode::Ok, |s| s.0);
                let mut headers: Headers = [("Content-Type", TESTING_CONTENT_TYPE)].into_iter().collect();
                if let Some(extra) = ctx.extensions().get::<ExtraHeaders>() {
                    for (name, value) in &extra.0 {
                        headers.insert(*name, *value);
                    }
                }
                async move { Response::new(status).headers_from(headers).body(contents) }
            })
            .layer(cache.clone());

            Self {
                _dir: dir,
                pipeline,
                calls,
                cache,
            }
        }

        async fn get(&self, target: &str, contents: &'static str) -> (StatusCode, Headers, String) {
            self.send(request(target).with_extension(Contents(contents))).await
        }

        async fn send(&self, ctx: Context) -> (StatusCode, Headers, String) {
            let mut response = self.pipeline.call(ctx).await;
            let body = response.take_body().collect().await.unwrap();
            (
                response.status(),
                response.headers().clone(),
                String::from_utf8(body.to_vec()).unwrap(),
            )
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn request(target: &str) -> Context {
        let raw = format!("GET {target} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        Context::new(Request::parse(raw.as_bytes()).unwrap().0)
    }

    #[tokio::test]
    async fn second_request_is_served_from_cache() {
        let h = Harness::new(|b| b);
        let (status, headers, body) = h.get("/", "foo").await;
        assert_eq!(status, StatusCode::Ok);
        assert_eq!(body, "foo");
        assert_eq!(headers.get("content-type"), Some(TESTING_CONTENT_TYPE));

        let (status, headers, body) = h.get("/", "bar").await;
        assert_eq!(status, StatusCode::Ok);
        assert_eq!(body, "foo");
        assert_eq!(headers.get("content-type"), Some("text/html"));
        assert_eq!(h.calls(), 1);
        assert!(h.cache.config().cache_root().join("index.html").is_file());
    }

    #[tokio::test]
    async fn hits_use_configured_content_type() {
        let h = Harness::new(|b| b.content_type("application/xhtml+xml"));
        h.get("/page", "<p/>").await;
        let (_, headers, _) = h.get("/page", "<q/>").await;
        assert_eq!(headers.get("content-type"), Some("application/xhtml+xml"));
        assert_eq!(headers.get_all("content-type").count(), 1);
    }

    #[tokio::test]
    async fn query_strings_bypass_the_cache() {
        let h = Harness::new(|b| b);
        assert_eq!(h.get("/foo?x=1", "A").await.2, "A");
        assert_eq!(h.get("/foo?x=1", "B").await.2, "B");
        assert_eq!(h.calls(), 2);
        assert!(!h.cache.store().is_cached(&CacheKey::new("foo")).await);

        // Nor is a cached entry consulted for a query request.
        h.get("/foo", "C").await;
        assert_eq!(h.get("/foo?x=1", "D").await.2, "D");
    }

    #[tokio::test]
    async fn cache_paths_restrict_caching() {
        let h = Harness::new(|b| b.cache_paths_list("/licenses"));

        assert_eq!(h.get("/index.html", "foo").await.2, "foo");
        assert_eq!(h.get("/index.html", "bar").await.2, "bar");

        assert_eq!(h.get("/licenses", "foo").await.2, "foo");
        assert_eq!(h.get("/licenses", "bar").await.2, "foo");
        assert_eq!(h.calls(), 3);
    }

    #[tokio::test]
    async fn directory_urls_store_index_file() {
        let h = Harness::new(|b| b.directory_index("default.html"));
        h.get("/licenses/by/3.0/", "by").await;
        let stored = h
            .cache
            .config()
            .cache_root()
            .join("licenses/by/3.0/default.html");
        assert_eq!(std::fs::read_to_string(stored).unwrap(), "by");
        assert_eq!(h.get("/licenses/by/3.0/", "other").await.2, "by");
    }

    #[tokio::test]
    async fn no_cache_responses_are_always_fresh() {
        let h = Harness::new(|b| b);
        for contents in ["first", "second"] {
            let ctx = request("/dynamic")
                .with_extension(Contents(contents))
                .with_extension(ExtraHeaders(vec![("Cache-Control", "no-cache")]));
            let (_, headers, body) = h.send(ctx).await;
            assert_eq!(body, contents);
            assert_eq!(headers.get("cache-control"), Some("no-cache"));
        }
        assert_eq!(h.calls(), 2);
    }

    #[tokio::test]
    async fn ignoring_cache_control_stores_anyway() {
        let h = Harness::new(|b| b.honor_cache_control(false));
        let ctx = request("/x")
            .with_extension(Contents("kept"))
            .with_extension(ExtraHeaders(vec![("Cache-Control", "no-store")]));
        h.send(ctx).await;
        assert_eq!(h.get("/x", "new").await.2, "kept");
    }

    #[tokio::test]
    async fn miss_response_keeps_inner_headers() {
        let h = Harness::new(|b| b);
        let ctx = request("/foo")
            .with_extension(Contents("bar"))
            .with_extension(ExtraHeaders(vec![("Foo", "Bar"), ("Cache-Control", "Blarf")]));
        let (_, headers, _) = h.send(ctx).await;
        assert_eq!(headers.get("foo"), Some("Bar"));
        assert_eq!(headers.get("cache-control"), Some("Blarf"));
    }

    #[tokio::test]
    async fn error_statuses_are_not_stored() {
        let h = Harness::new(|b| b);
        let ctx = request("/gone")
            .with_extension(Contents("missing"))
            .with_extension(Status(StatusCode::NotFound));
        let (status, _, _) = h.send(ctx).await;
        assert_eq!(status, StatusCode::NotFound);
        assert_eq!(h.get("/gone", "back").await.2, "back");
    }

    #[tokio::test]
    async fn empty_bodies_are_regenerated() {
        let h = Harness::new(|b| b);
        assert_eq!(h.get("/empty", "").await.2, "");
        assert_eq!(h.get("/empty", "now").await.2, "now");
        assert_eq!(h.get("/empty", "later").await.2, "now");
        assert_eq!(h.calls(), 2);
    }

    #[tokio::test]
    async fn traversal_paths_pass_through() {
        let h = Harness::new(|b| b);
        assert_eq!(h.get("/../escape", "a").await.2, "a");
        assert_eq!(h.get("/../escape", "b").await.2, "b");
        let parent = h.cache.config().cache_root().parent().unwrap().to_path_buf();
        assert!(!parent.join("escape").exists());
    }

    #[tokio::test]
    async fn storage_failure_is_a_server_error() {
        let h = Harness::new(|b| b);
        h.get("/file", "x").await;
        // "file" is now a regular file; "file/child" cannot be stored below it.
        let (status, _, _) = h.get("/file/child", "y").await;
        assert_eq!(status, StatusCode::InternalServerError);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_run_inner_handler_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::builder(dir.path(), "cache").build().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let pipeline = Pipeline::new(move |_ctx: Context| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Response::new(StatusCode::Ok).body(format!("render {n}"))
            }
        })
        .layer(CacheMiddleware::new(config));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let pipeline = pipeline.clone();
                tokio::spawn(async move {
                    let response = pipeline.call(request("/slow")).await;
                    response.into_body().collect().await.unwrap()
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().as_ref(), b"render 0");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_no_store_requests_are_not_queued() {
        const RENDER: Duration = Duration::from_millis(200);

        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::builder(dir.path(), "cache").build().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let pipeline = Pipeline::new(move |_ctx: Context| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(RENDER).await;
                Response::new(StatusCode::Ok)
                    .header("Cache-Control", "no-store")
                    .body("fresh")
            }
        })
        .layer(CacheMiddleware::new(config));

        let started = tokio::time::Instant::now();
        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let pipeline = pipeline.clone();
                tokio::spawn(async move { pipeline.call(request("/dyn")).await.status() })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap(), StatusCode::Ok);
        }

        // The first render holds the lock; everyone queued behind it then
        // renders in parallel instead of one at a time.
        let elapsed = started.elapsed();
        assert!(elapsed < RENDER * 3, "took {elapsed:?}");
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn built_from_settings() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheSettings::from_options([("cache_dir", "c"), ("cache_paths", "/only")])
            .unwrap()
            .into_config(dir.path())
            .unwrap();
        let cache = CacheMiddleware::new(config);
        assert_eq!(cache.store().root(), dir.path().join("c"));
        assert_eq!(cache.config().cache_path_prefixes().map(<[String]>::len), Some(1));
    }
}

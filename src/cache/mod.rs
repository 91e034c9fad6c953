//! Disk-backed response cache.
//!
//! [`CacheMiddleware`] sits in a [`Pipeline`](crate::middleware::Pipeline)
//! and keeps the body of every storable `200 OK` response as a plain file
//! under a cache root, one file per request path. Later requests for the
//! same path are answered from that file without reaching the endpoint.
//!
//! ## Pieces
//!
//! - [`classify`] / [`derive_key`]: which requests are cacheable, and under what key.
//! - [`DiskStore`]: maps keys to files and does the probe, write and load.
//! - [`ResponsePolicy`]: whether a fresh response may be stored.
//! - [`KeyLocks`]: serializes concurrent misses for the same key.
//! - [`CacheConfig`] / [`CacheSettings`]: validated configuration and its loose form.
//!
//! A stored file of length zero counts as absent, so an interrupted or
//! empty write is regenerated on the next request.

mod config;
mod error;
mod key;
mod lock;
mod middleware;
mod policy;
mod storage;

pub use config::{CacheConfig, CacheConfigBuilder, CacheSettings};
pub use error::CacheError;
pub use key::{CacheKey, Eligibility, classify, derive_key};
pub use lock::{KeyGuard, KeyLocks};
pub use middleware::CacheMiddleware;
pub use policy::{CacheControl, Rejection, ResponsePolicy};
pub use storage::DiskStore;

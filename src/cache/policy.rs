//! Post-invocation gate deciding whether a response may be stored.

use crate::http::{Headers, StatusCode};
use crate::Response;

/// Storage-relevant `Cache-Control` directives of a response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub no_store: bool,
    pub no_cache: bool,
    pub private: bool,
}

impl CacheControl {
    /// Reads every `Cache-Control` header. Directive names are
    /// case-insensitive; arguments (`no-cache="Set-Cookie"`) are ignored.
    pub fn from_headers(headers: &Headers) -> Self {
        let mut cc = Self::default();
        for token in headers.tokens("cache-control") {
            let name = token.split('=').next().unwrap_or(token).trim();
            if name.eq_ignore_ascii_case("no-store") {
                cc.no_store = true;
            } else if name.eq_ignore_ascii_case("no-cache") {
                cc.no_cache = true;
            } else if name.eq_ignore_ascii_case("private") {
                cc.private = true;
            }
        }
        cc
    }

    /// `true` when any directive forbids keeping a shared copy.
    pub fn forbids_storage(&self) -> bool {
        self.no_store || self.no_cache || self.private
    }
}

/// Decides whether a response produced by the inner handler is stored.
#[derive(Debug, Clone, Copy)]
pub struct ResponsePolicy {
    honor_cache_control: bool,
}

/// Why a response was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Status(StatusCode),
    CacheControl,
    Pragma,
}

impl ResponsePolicy {
    pub fn new(honor_cache_control: bool) -> Self {
        Self {
            honor_cache_control,
        }
    }

    /// Only `200 OK` is stored; with cache-control honored, `no-store`,
    /// `no-cache`, `private` and `Pragma: no-cache` also veto storage.
    pub fn check(&self, response: &Response) -> Result<(), Rejection> {
        if response.status() != StatusCode::Ok {
            return Err(Rejection::Status(response.status()));
        }
        if !self.honor_cache_control {
            return Ok(());
        }

        let headers = response.headers();
        if CacheControl::from_headers(headers).forbids_storage() {
            return Err(Rejection::CacheControl);
        }
        if headers
            .tokens("pragma")
            .any(|t| t.eq_ignore_ascii_case("no-cache"))
        {
            return Err(Rejection::Pragma);
        }
        Ok(())
    }
}

impl Default for ResponsePolicy {
    fn default() -> Self {
        Self::new(true)
    }
}

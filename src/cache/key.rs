//! Request classification and cache-key derivation.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use super::CacheError;

/// Directory under the cache root that holds in-flight writes. Keys may not
/// start with it.
pub(crate) const STAGING_DIR: &str = ".staging";

/// A request path with its leading `/` removed.
///
/// Two requests for the same path always produce equal keys. Keys are not
/// normalized; [`CacheKey::relative_path`] decides whether one is safe to use
/// as a filesystem location.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A key for `/` or for any path ending in `/` names a directory; its
    /// content lives in the directory index file.
    pub fn is_directory(&self) -> bool {
        self.0.is_empty() || self.0.ends_with('/')
    }

    /// Converts the key into a path relative to the cache root.
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidKey`] if any component is not a plain name (`.`,
    /// `..`, an absolute root, a drive prefix), if the key has an empty
    /// segment before its end (`a//b`), if it contains NUL, or if it points
    /// into the staging directory. `.` and empty segments would otherwise be
    /// dropped by path normalization, aliasing `foo/.` to `foo`.
    pub fn relative_path(&self) -> Result<PathBuf, CacheError> {
        let invalid = || CacheError::InvalidKey {
            key: self.0.clone(),
        };

        if self.0.contains('\0') {
            return Err(invalid());
        }

        let mut segments = self.0.split('/').peekable();
        while let Some(segment) = segments.next() {
            let trailing = segments.peek().is_none();
            if segment == "." || (segment.is_empty() && !trailing) {
                return Err(invalid());
            }
        }

        let mut relative = PathBuf::new();
        for component in Path::new(&self.0).components() {
            match component {
                Component::Normal(name) => relative.push(name),
                _ => return Err(invalid()),
            }
        }

        if relative.starts_with(STAGING_DIR) {
            return Err(invalid());
        }
        Ok(relative)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives the cache key for a request path by stripping one leading `/`.
///
/// ```
/// use rttp_diskcache::cache::derive_key;
///
/// assert_eq!(derive_key("/licenses/by/3.0/").as_str(), "licenses/by/3.0/");
/// assert_eq!(derive_key("/").as_str(), "");
/// ```
pub fn derive_key(path: &str) -> CacheKey {
    CacheKey::new(path.strip_prefix('/').unwrap_or(path))
}

/// Outcome of [`classify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    /// Forward to the inner handler; never read or write the cache.
    MissThrough,
    /// Look the key up and store a qualifying response under it.
    Cacheable(CacheKey),
}

/// Decides whether a request may use the cache at all.
///
/// In order:
/// 1. any non-empty query string bypasses the cache;
/// 2. when `prefixes` is non-empty, the path must start with one of them;
/// 3. the derived key must stay inside the cache root.
pub fn classify(path: &str, query: Option<&str>, prefixes: Option<&[String]>) -> Eligibility {
    if query.is_some_and(|q| !q.is_empty()) {
        return Eligibility::MissThrough;
    }

    if let Some(prefixes) = prefixes.filter(|p| !p.is_empty()) {
        if !prefixes.iter().any(|prefix| path.starts_with(prefix.as_str())) {
            return Eligibility::MissThrough;
        }
    }

    let key = derive_key(path);
    if let Err(e) = key.relative_path() {
        tracing::warn!(path = %path, error = %e, "refusing to cache request path");
        return Eligibility::MissThrough;
    }

    Eligibility::Cacheable(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefixes(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn derive_strips_single_leading_slash() {
        assert_eq!(derive_key("/foo").as_str(), "foo");
        assert_eq!(derive_key("/a/b/c").as_str(), "a/b/c");
        assert_eq!(derive_key("//etc").as_str(), "/etc");
    }

    #[test]
    fn directory_style_keys() {
        assert!(derive_key("/").is_directory());
        assert!(derive_key("/licenses/by/3.0/").is_directory());
        assert!(!derive_key("/licenses").is_directory());
    }

    #[test]
    fn query_string_bypasses() {
        assert_eq!(classify("/foo", Some("x=1"), None), Eligibility::MissThrough);
        assert_eq!(
            classify("/foo", Some(""), None),
            Eligibility::Cacheable(CacheKey::new("foo"))
        );
    }

    #[test]
    fn prefixes_restrict_eligibility() {
        let p = prefixes(&["/licenses"]);
        assert_eq!(classify("/index.html", None, Some(p.as_slice())), Eligibility::MissThrough);
        assert_eq!(classify("/", None, Some(p.as_slice())), Eligibility::MissThrough);
        assert_eq!(
            classify("/licenses", None, Some(p.as_slice())),
            Eligibility::Cacheable(CacheKey::new("licenses"))
        );
        // Plain string prefix, not a segment match.
        assert_eq!(
            classify("/licenses-old/x", None, Some(p.as_slice())),
            Eligibility::Cacheable(CacheKey::new("licenses-old/x"))
        );
    }

    #[test]
    fn empty_prefix_list_caches_everything() {
        let p = prefixes(&[]);
        assert_eq!(
            classify("/anything", None, Some(p.as_slice())),
            Eligibility::Cacheable(CacheKey::new("anything"))
        );
    }

    #[test]
    fn escaping_keys_bypass() {
        for path in [
            "/../etc/passwd",
            "/a/../../b",
            "//etc/passwd",
            "/./b",
            "/foo/.",
            "/a/./b",
            "/a//b",
            "/x\0y",
            "/.staging/1.tmp",
        ] {
            assert_eq!(classify(path, None, None), Eligibility::MissThrough, "{path:?}");
        }
    }

    #[test]
    fn relative_path_drops_trailing_separator() {
        let rel = derive_key("/foo/bar/").relative_path().unwrap();
        assert_eq!(rel, PathBuf::from("foo").join("bar"));
        assert_eq!(derive_key("/").relative_path().unwrap(), PathBuf::new());
    }

    #[test]
    fn dotted_names_are_plain() {
        assert!(derive_key("/.well-known/security.txt").relative_path().is_ok());
        assert!(derive_key("/a..b").relative_path().is_ok());
    }
}

//! On-disk layout of cached bodies.
//!
//! The cache root mirrors the URL hierarchy: key `a/b/c` lives at
//! `<root>/a/b/c`, and a directory-style key `a/b/` at
//! `<root>/a/b/<directory_index>`. Only response bodies are stored.
//!
//! Writes go to a uniquely named file in `<root>/.staging/` and are renamed
//! into place, so a reader sees either the previous file or the complete
//! new one. Zero-length files still count as absent, which covers trees
//! written by tools that wrote in place.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

use super::key::STAGING_DIR;
use super::{CacheConfig, CacheError, CacheKey};
use crate::http::Body;

// Distinguishes staging files written by this process.
static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

/// Filesystem store for cached response bodies.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
    directory_index: String,
}

impl DiskStore {
    /// Creates a store over an existing root directory.
    pub fn new(root: impl Into<PathBuf>, directory_index: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            directory_index: directory_index.into(),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.cache_root(), config.directory_index())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a key to the file holding its body. Does not touch the filesystem.
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidKey`] if the key would leave the cache root.
    pub fn resolve(&self, key: &CacheKey) -> Result<PathBuf, CacheError> {
        let mut path = self.root.join(key.relative_path()?);
        if key.is_directory() {
            path.push(&self.directory_index);
        }
        Ok(path)
    }

    /// Returns `true` iff a non-empty regular file is stored for `key`.
    pub async fn is_cached(&self, key: &CacheKey) -> bool {
        let Ok(path) = self.resolve(key) else {
            return false;
        };
        match fs::metadata(&path).await {
            Ok(meta) => meta.is_file() && meta.len() > 0,
            Err(_) => false,
        }
    }

    /// Writes `chunks` as the body stored for `key` and returns its path.
    ///
    /// Missing parent directories are created; a concurrent request creating
    /// the same directories is not an error. Concurrent stores of one key
    /// each complete, and the last rename wins.
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidKey`] for escaping keys, [`CacheError::Io`] for
    /// any filesystem failure. The staging file is removed on failure.
    pub async fn store<I, C>(&self, key: &CacheKey, chunks: I) -> Result<PathBuf, CacheError>
    where
        I: IntoIterator<Item = C>,
        C: AsRef<[u8]>,
    {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let staging = self.root.join(STAGING_DIR);
        fs::create_dir_all(&staging).await?;
        let tmp = staging.join(format!(
            "{}-{}.tmp",
            std::process::id(),
            STAGING_SEQ.fetch_add(1, Ordering::Relaxed)
        ));

        match write_then_rename(&tmp, &path, chunks).await {
            Ok(written) => {
                debug!(key = %key, bytes = written, path = %path.display(), "stored cache entry");
                Ok(path)
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp).await;
                Err(e.into())
            }
        }
    }

    /// Opens the body stored for `key` as a lazily read [`Body`].
    ///
    /// # Errors
    ///
    /// [`CacheError::NotFound`] when nothing valid is stored, i.e. whenever
    /// [`is_cached`](Self::is_cached) would have returned `false`.
    pub async fn load(&self, key: &CacheKey) -> Result<Body, CacheError> {
        let path = self.resolve(key)?;
        let not_found = || CacheError::NotFound {
            key: key.as_str().to_owned(),
        };

        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if is_absent(&e) => return Err(not_found()),
            Err(e) => return Err(e.into()),
        };
        let meta = file.metadata().await?;
        if !meta.is_file() || meta.len() == 0 {
            return Err(not_found());
        }

        trace!(key = %key, bytes = meta.len(), "loading cache entry");
        Ok(Body::from_file(file, meta.len()))
    }
}

async fn write_then_rename<I, C>(tmp: &Path, dest: &Path, chunks: I) -> io::Result<u64>
where
    I: IntoIterator<Item = C>,
    C: AsRef<[u8]>,
{
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(tmp)
        .await?;

    let mut written = 0u64;
    for chunk in chunks {
        let chunk = chunk.as_ref();
        file.write_all(chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    drop(file);

    fs::rename(tmp, dest).await?;
    Ok(written)
}

// A path component that is a regular file shows up as NotADirectory on open.
fn is_absent(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory | io::ErrorKind::IsADirectory
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::derive_key;
    use bytes::Bytes;
    use std::sync::Arc;

    fn store() -> (tempfile::TempDir, DiskStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path().join("cache"), "index.html");
        std::fs::create_dir_all(store.root()).unwrap();
        (dir, store)
    }

    fn key(k: &str) -> CacheKey {
        CacheKey::new(k)
    }

    #[test]
    fn resolve_stays_under_root() {
        let (_dir, store) = store();
        let path = store.resolve(&key("foo")).unwrap();
        assert!(path.starts_with(store.root()));
        assert_eq!(path, store.root().join("foo"));
    }

    #[test]
    fn resolve_substitutes_directory_index() {
        let (_dir, store) = store();
        let path = store.resolve(&key("bar/baz/")).unwrap();
        assert!(path.ends_with("index.html"));
        assert_eq!(path, store.root().join("bar").join("baz").join("index.html"));
        assert_eq!(
            store.resolve(&derive_key("/")).unwrap(),
            store.root().join("index.html")
        );
    }

    #[test]
    fn resolve_rejects_escapes() {
        let (_dir, store) = store();
        for k in ["../x", "a/../../x", "/etc/passwd", ".staging/0-0.tmp"] {
            assert!(
                matches!(store.resolve(&key(k)), Err(CacheError::InvalidKey { .. })),
                "{k:?}"
            );
        }
    }

    #[tokio::test]
    async fn nothing_is_cached_initially() {
        let (_dir, store) = store();
        assert!(!store.is_cached(&key("foo")).await);
        assert!(!store.is_cached(&key("foo/bar")).await);
    }

    #[tokio::test]
    async fn plain_file_counts_as_cached() {
        let (_dir, store) = store();
        std::fs::write(store.root().join("bar"), b"\n").unwrap();
        assert!(store.is_cached(&key("bar")).await);
    }

    #[tokio::test]
    async fn directories_are_not_cache_hits() {
        let (_dir, store) = store();
        std::fs::create_dir(store.root().join("dir")).unwrap();
        assert!(!store.is_cached(&key("dir")).await);
        assert!(matches!(
            store.load(&key("dir")).await,
            Err(CacheError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn store_then_load_returns_same_bytes_across_chunkings() {
        let (_dir, store) = store();
        let content: Vec<u8> = (0..20_000u32).map(|i| (i * 7 % 251) as u8).collect();

        for (i, split) in [1usize, 3, 4096, 20_000].into_iter().enumerate() {
            let k = key(&format!("blob{i}"));
            let chunks: Vec<&[u8]> = content.chunks(split).collect();
            store.store(&k, &chunks).await.unwrap();
            let loaded = store.load(&k).await.unwrap().collect().await.unwrap();
            assert_eq!(loaded.as_ref(), content.as_slice(), "split {split}");
        }
    }

    #[tokio::test]
    async fn empty_store_is_absent_until_rewritten() {
        let (_dir, store) = store();
        let k = key("test");
        store.store(&k, [Bytes::new()]).await.unwrap();
        assert!(store.root().join("test").is_file());
        assert!(!store.is_cached(&k).await);
        assert!(matches!(store.load(&k).await, Err(CacheError::NotFound { .. })));

        store.store(&k, [Bytes::from("real")]).await.unwrap();
        assert!(store.is_cached(&k).await);
        let loaded = store.load(&k).await.unwrap().collect().await.unwrap();
        assert_eq!(loaded, Bytes::from("real"));
    }

    #[tokio::test]
    async fn store_creates_subdirectories() {
        let (_dir, store) = store();
        let k = key("a/b/c");
        assert!(!store.is_cached(&k).await);
        store.store(&k, ["data"]).await.unwrap();
        assert!(store.root().join("a").is_dir());
        assert!(store.root().join("a").join("b").is_dir());
        assert!(store.is_cached(&k).await);
    }

    #[tokio::test]
    async fn directory_key_lands_in_index_file() {
        let (_dir, store) = store();
        let path = store.store(&key("foo/bar/"), ["<html/>"]).await.unwrap();
        let expected = store.root().join("foo").join("bar").join("index.html");
        assert_eq!(path, expected);
        assert_eq!(std::fs::read(expected).unwrap(), b"<html/>");
    }

    #[tokio::test]
    async fn staging_is_left_empty() {
        let (_dir, store) = store();
        store.store(&key("x"), ["1"]).await.unwrap();
        store.store(&key("x"), ["2"]).await.unwrap();
        let leftovers = std::fs::read_dir(store.root().join(STAGING_DIR)).unwrap().count();
        assert_eq!(leftovers, 0);
        assert_eq!(std::fs::read(store.root().join("x")).unwrap(), b"2");
    }

    #[tokio::test]
    async fn failed_store_cleans_up_staging() {
        let (_dir, store) = store();
        store.store(&key("file"), ["x"]).await.unwrap();
        // "file" is a regular file, so "file/child" cannot get a parent directory.
        assert!(store.store(&key("file/child"), ["y"]).await.is_err());
        // Destination rename target is a directory.
        std::fs::create_dir_all(store.root().join("dir").join("sub")).unwrap();
        assert!(store.store(&key("dir"), ["z"]).await.is_err());
        let leftovers = std::fs::read_dir(store.root().join(STAGING_DIR)).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn load_without_entry_is_not_found() {
        let (_dir, store) = store();
        let err = store.load(&key("missing/deep")).await.unwrap_err();
        assert!(matches!(err, CacheError::NotFound { key } if key == "missing/deep"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sibling_writes_share_new_parent() {
        let (_dir, store) = store();
        let store = Arc::new(store);

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let k = CacheKey::new(format!("new/parent/child{i}"));
                    store.store(&k, [format!("body {i}")]).await.map(|_| k)
                })
            })
            .collect();

        for task in tasks {
            let k = task.await.unwrap().unwrap();
            assert!(store.is_cached(&k).await);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_to_one_key_leave_a_complete_body() {
        let (_dir, store) = store();
        let store = Arc::new(store);
        let bodies: Vec<String> = (0..8).map(|i| format!("{i}").repeat(10_000)).collect();

        let tasks: Vec<_> = bodies
            .iter()
            .cloned()
            .map(|body| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.store(&key("same"), [body]).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let stored = store.load(&key("same")).await.unwrap().collect().await.unwrap();
        assert!(bodies.iter().any(|b| b.as_bytes() == stored.as_ref()));
    }
}

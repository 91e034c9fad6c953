//! Cache configuration.
//!
//! [`CacheConfig`] is what the middleware runs with: validated, with the
//! cache root resolved to an absolute path that already exists.
//! [`CacheSettings`] is the raw, deserializable form of the recognized
//! options, as they appear in a JSON document or a key/value option list.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::CacheError;
use super::key::STAGING_DIR;

fn default_content_type() -> String {
    "text/html".to_string()
}

fn default_directory_index() -> String {
    "index.html".to_string()
}

fn default_true() -> bool {
    true
}

/// Recognized cache options before validation.
///
/// | option                | default      |
/// |-----------------------|--------------|
/// | `cache_dir`           | *(required)* |
/// | `content_type`        | `text/html`  |
/// | `cache_paths`         | *(none)*     |
/// | `directory_index`     | `index.html` |
/// | `honor_cache_control` | `true`       |
/// | `lock_misses`         | `true`       |
///
/// # Examples
///
/// ```
/// use rttp_diskcache::cache::CacheSettings;
///
/// let settings = CacheSettings::from_json(
///     r#"{ "cache_dir": "cache", "cache_paths": "/licenses, /publicdomain" }"#,
/// )
/// .unwrap();
/// assert_eq!(settings.directory_index, "index.html");
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    /// Cache directory, relative to the base directory.
    pub cache_dir: String,

    /// Content type sent with every cache hit.
    #[serde(default = "default_content_type")]
    pub content_type: String,

    /// Comma-separated path prefixes; absent or empty caches every path.
    #[serde(default)]
    pub cache_paths: Option<String>,

    /// File name used for directory-style URLs.
    #[serde(default = "default_directory_index")]
    pub directory_index: String,

    /// Skip storing responses marked `no-store`, `no-cache` or `private`.
    #[serde(default = "default_true")]
    pub honor_cache_control: bool,

    /// Serialize concurrent misses for the same key.
    #[serde(default = "default_true")]
    pub lock_misses: bool,
}

impl CacheSettings {
    /// Parses settings from a JSON object.
    pub fn from_json(json: &str) -> Result<Self, CacheError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Builds settings from string key/value pairs, as found in a deployment
    /// config file section. Unknown keys are logged and ignored.
    ///
    /// # Errors
    ///
    /// [`CacheError::MissingOption`] without `cache_dir`;
    /// [`CacheError::InvalidOption`] for a boolean that is not `true`/`false`.
    pub fn from_options<I, K, V>(options: I) -> Result<Self, CacheError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut cache_dir = None;
        let mut settings = Self {
            cache_dir: String::new(),
            content_type: default_content_type(),
            cache_paths: None,
            directory_index: default_directory_index(),
            honor_cache_control: true,
            lock_misses: true,
        };

        for (name, value) in options {
            let name = name.as_ref();
            let value = value.into();
            match name {
                "cache_dir" => cache_dir = Some(value),
                "content_type" => settings.content_type = value,
                "cache_paths" => settings.cache_paths = Some(value),
                "directory_index" => settings.directory_index = value,
                "honor_cache_control" => settings.honor_cache_control = parse_bool(name, value)?,
                "lock_misses" => settings.lock_misses = parse_bool(name, value)?,
                other => tracing::warn!(option = %other, "ignoring unknown cache option"),
            }
        }

        settings.cache_dir = cache_dir.ok_or(CacheError::MissingOption { name: "cache_dir" })?;
        Ok(settings)
    }

    /// Validates the settings and creates the cache root under `base_dir`.
    pub fn into_config(self, base_dir: impl AsRef<Path>) -> Result<CacheConfig, CacheError> {
        let mut builder = CacheConfig::builder(base_dir, self.cache_dir)
            .content_type(self.content_type)
            .directory_index(self.directory_index)
            .honor_cache_control(self.honor_cache_control)
            .lock_misses(self.lock_misses);
        if let Some(paths) = self.cache_paths {
            builder = builder.cache_paths_list(&paths);
        }
        builder.build()
    }
}

fn parse_bool(name: &str, value: String) -> Result<bool, CacheError> {
    match value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(CacheError::InvalidOption {
            name: name.to_owned(),
            value,
        }),
    }
}

/// Validated, immutable cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    cache_root: PathBuf,
    content_type: String,
    cache_path_prefixes: Option<Vec<String>>,
    directory_index: String,
    honor_cache_control: bool,
    lock_misses: bool,
}

impl CacheConfig {
    /// Starts a configuration rooted at `base_dir / cache_dir`.
    pub fn builder(base_dir: impl AsRef<Path>, cache_dir: impl AsRef<Path>) -> CacheConfigBuilder {
        CacheConfigBuilder {
            root: base_dir.as_ref().join(cache_dir),
            content_type: default_content_type(),
            cache_paths: Vec::new(),
            directory_index: default_directory_index(),
            honor_cache_control: true,
            lock_misses: true,
        }
    }

    /// Absolute cache root. Exists once the config has been built.
    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Prefixes restricting what is cached; `None` caches everything.
    pub fn cache_path_prefixes(&self) -> Option<&[String]> {
        self.cache_path_prefixes.as_deref()
    }

    pub fn directory_index(&self) -> &str {
        &self.directory_index
    }

    pub fn honor_cache_control(&self) -> bool {
        self.honor_cache_control
    }

    pub fn lock_misses(&self) -> bool {
        self.lock_misses
    }
}

/// Builder for [`CacheConfig`]; see [`CacheConfig::builder`].
///
/// # Examples
///
/// ```no_run
/// use rttp_diskcache::cache::CacheConfig;
///
/// let config = CacheConfig::builder("/srv/site", "cache")
///     .cache_paths_list("/licenses,/publicdomain")
///     .content_type("text/html; charset=utf-8")
///     .build()?;
/// assert!(config.cache_root().is_dir());
/// # Ok::<(), rttp_diskcache::cache::CacheError>(())
/// ```
#[derive(Debug, Clone)]
pub struct CacheConfigBuilder {
    root: PathBuf,
    content_type: String,
    cache_paths: Vec<String>,
    directory_index: String,
    honor_cache_control: bool,
    lock_misses: bool,
}

impl CacheConfigBuilder {
    #[must_use]
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Adds one path prefix.
    #[must_use]
    pub fn cache_path(mut self, prefix: impl Into<String>) -> Self {
        self.cache_paths.push(prefix.into());
        self
    }

    /// Adds every prefix of a comma-separated list. Whitespace around
    /// entries and empty entries are dropped.
    #[must_use]
    pub fn cache_paths_list(mut self, list: &str) -> Self {
        self.cache_paths.extend(
            list.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_owned),
        );
        self
    }

    #[must_use]
    pub fn directory_index(mut self, name: impl Into<String>) -> Self {
        self.directory_index = name.into();
        self
    }

    #[must_use]
    pub fn honor_cache_control(mut self, honor: bool) -> Self {
        self.honor_cache_control = honor;
        self
    }

    #[must_use]
    pub fn lock_misses(mut self, lock: bool) -> Self {
        self.lock_misses = lock;
        self
    }

    /// Validates the options and creates the cache root if it is missing.
    ///
    /// # Errors
    ///
    /// - [`CacheError::InvalidPrefix`] for a prefix not starting with `/`.
    /// - [`CacheError::InvalidOption`] for an empty directory index, one
    ///   containing a path separator, or the reserved staging name.
    /// - [`CacheError::CreateRoot`] if the root cannot be resolved or created.
    pub fn build(self) -> Result<CacheConfig, CacheError> {
        if let Some(prefix) = self.cache_paths.iter().find(|p| !p.starts_with('/')) {
            return Err(CacheError::InvalidPrefix {
                prefix: prefix.clone(),
            });
        }

        if self.directory_index.is_empty()
            || self.directory_index.contains(['/', '\\'])
            || matches!(self.directory_index.as_str(), "." | ".." | STAGING_DIR)
        {
            return Err(CacheError::InvalidOption {
                name: "directory_index".to_owned(),
                value: self.directory_index,
            });
        }

        let create_root = |source| CacheError::CreateRoot {
            path: self.root.clone(),
            source,
        };
        let cache_root = std::path::absolute(&self.root).map_err(create_root)?;
        std::fs::create_dir_all(&cache_root).map_err(create_root)?;

        tracing::debug!(root = %cache_root.display(), "cache root ready");

        Ok(CacheConfig {
            cache_root,
            content_type: self.content_type,
            cache_path_prefixes: (!self.cache_paths.is_empty()).then_some(self.cache_paths),
            directory_index: self.directory_index,
            honor_cache_control: self.honor_cache_control,
            lock_misses: self.lock_misses,
        })
    }
}

//! Cache key derivation.
//!
//! Keys are built from the fully resolved request path, so two concrete URLs
//! under the same dynamic route (`/posts/a`, `/posts/b`) never share an entry.

use std::fmt;
use std::sync::Arc;

/// Identifies one cached page or shell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    /// Derive a key from a resolved request path.
    ///
    /// The query string is dropped and a single trailing slash is stripped,
    /// except for the root path.
    pub fn from_path(path: &str) -> Self {
        let path = path.split_once('?').map_or(path, |(path, _query)| path);
        let path = if path.len() > 1 {
            path.strip_suffix('/').unwrap_or(path)
        } else {
            path
        };

        if path.is_empty() {
            Self(Arc::from("/"))
        } else {
            Self(Arc::from(path))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(path: &str) -> Self {
        Self::from_path(path)
    }
}

//! Read-through cache over state files.
//!
//! Each backing file is read at most once per pass; later reads are
//! served from memory. The cache is single-threaded and owned by the pass
//! context.
//!
//! Any writer of a cached file must call [`ReadCache::invalidate`] for that
//! key before the next reader runs, otherwise the reader observes the value
//! loaded before the write.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::{klog_trace, Result};

/// Cached file contents; `None` records that the file was absent.
#[derive(Debug, Default)]
pub struct ReadCache {
    entries: HashMap<PathBuf, Option<String>>,
    loads: usize,
}

impl ReadCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached value for `key`, calling `loader` on first use.
    ///
    /// A loader error is not cached, so the next call retries the load.
    pub fn get<F>(&mut self, key: &Path, loader: F) -> Result<Option<&str>>
    where
        F: FnOnce(&Path) -> Result<Option<String>>,
    {
        if !self.entries.contains_key(key) {
            let value = loader(key)?;
            self.loads += 1;
            klog_trace!("cache load {} (present={})", key.display(), value.is_some());
            self.entries.insert(key.to_path_buf(), value);
        }
        Ok(self.entries.get(key).and_then(|v| v.as_deref()))
    }

    /// Drop the cached value for `key`.
    pub fn invalidate(&mut self, key: &Path) {
        self.entries.remove(key);
    }

    /// Number of loader invocations so far.
    pub fn loads(&self) -> usize {
        self.loads
    }
}

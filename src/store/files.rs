//! StateStore - whole-file record sets in the state directory.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::store::cache::ReadCache;
use crate::{klog_debug, klog_warn, Result};

/// The record sets the control plane reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordSet {
    Tasks,
    Circuits,
    HookResults,
    Backlog,
    Followups,
    Observations,
    RejectedObservations,
    Friction,
    Platforms,
}

impl RecordSet {
    pub fn file_name(&self) -> &'static str {
        match self {
            RecordSet::Tasks => "work-queue.json",
            RecordSet::Circuits => "circuits.json",
            RecordSet::HookResults => "hook-results.json",
            RecordSet::Backlog => "backlog.md",
            RecordSet::Followups => "followups.json",
            RecordSet::Observations => "observations.json",
            RecordSet::RejectedObservations => "observations-rejected.json",
            RecordSet::Friction => "friction.json",
            RecordSet::Platforms => "platforms.json",
        }
    }
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Replace `path` with `contents` via a temp file and rename, keeping the
/// previous version as `<name>.bak`.
pub fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    if path.exists() {
        fs::copy(path, sibling(path, "bak"))?;
    }
    let temp_path = sibling(path, "tmp");
    fs::write(&temp_path, contents)?;
    fs::rename(&temp_path, path)?;
    klog_debug!("State saved: {}", path.display());
    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// Single-writer store over the state directory, reading through a cache.
#[derive(Debug)]
pub struct StateStore {
    dir: PathBuf,
    cache: ReadCache,
}

impl StateStore {
    pub fn open(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            cache: ReadCache::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, set: RecordSet) -> PathBuf {
        self.dir.join(set.file_name())
    }

    pub fn cache(&self) -> &ReadCache {
        &self.cache
    }

    /// Raw text of a file, read at most once until invalidated.
    pub fn read_text_at(&mut self, path: &Path) -> Result<Option<String>> {
        Ok(self.cache.get(path, read_optional)?.map(str::to_string))
    }

    /// Core state: a missing file yields the default value, a corrupt file
    /// is an error.
    pub fn load_json_at<T>(&mut self, path: &Path) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        match self.cache.get(path, read_optional)? {
            Some(text) if !text.trim().is_empty() => Ok(serde_json::from_str(text)?),
            _ => Ok(T::default()),
        }
    }

    pub fn load_json<T>(&mut self, set: RecordSet) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        let path = self.path(set);
        self.load_json_at(&path)
    }

    /// Signal sources: anything unreadable or unparseable counts as empty.
    pub fn load_json_lenient<T>(&mut self, set: RecordSet) -> T
    where
        T: DeserializeOwned + Default,
    {
        let path = self.path(set);
        match self.load_json_at(&path) {
            Ok(value) => value,
            Err(e) => {
                klog_warn!("Skipping unreadable {}: {}", path.display(), e);
                T::default()
            }
        }
    }

    pub fn write_json_at<T: Serialize>(&mut self, path: &Path, value: &T) -> Result<()> {
        let contents = serde_json::to_string_pretty(value)?;
        self.write_text_at(path, &contents)
    }

    pub fn write_json<T: Serialize>(&mut self, set: RecordSet, value: &T) -> Result<()> {
        let path = self.path(set);
        self.write_json_at(&path, value)
    }

    pub fn write_text_at(&mut self, path: &Path, contents: &str) -> Result<()> {
        atomic_write(path, contents)?;
        self.cache.invalidate(path);
        Ok(())
    }

    /// Invalidate after a write performed outside the store (e.g. on a
    /// blocking thread).
    pub fn invalidate(&mut self, path: &Path) {
        self.cache.invalidate(path);
    }
}

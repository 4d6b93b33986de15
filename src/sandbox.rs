//! Per-job sandbox directories and their reverse lookup.
//!
//! Every submitted job leaves a zero-length marker file named exactly
//! like its backend-qualified id inside its sandbox; `get_sandbox` finds
//! the directory back from the id. A cache of already-seen subdirectory
//! names keeps the lookup O(new entries): on a miss only the directory
//! entries that appeared since the last listing are probed.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{GcError, Result};

/// All sandbox deletions in the process funnel through this lock, so a
/// concurrent lookup never observes a half-removed directory tree.
pub static PURGE_LOCK: Mutex<()> = Mutex::new(());

pub struct SandboxHelper {
    path: PathBuf,
    cache: Mutex<Vec<String>>,
}

impl SandboxHelper {
    /// Use `path` as the sandbox base, creating it if needed.
    pub fn new(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path).map_err(|e| {
            GcError::Backend(format!(
                "unable to create sandbox base {:?}: {e}",
                path.display()
            ))
        })?;
        Ok(SandboxHelper {
            path: path.to_path_buf(),
            cache: Mutex::new(Vec::new()),
        })
    }

    pub fn get_path(&self) -> &Path {
        &self.path
    }

    /// The sandbox containing a file named exactly `gc_id`, if any.
    pub fn get_sandbox(&self, gc_id: &str) -> Option<PathBuf> {
        let mut cache = self.cache.lock().expect("sandbox cache poisoned");
        if let Some(found) = self.search(cache.iter().map(String::as_str), gc_id) {
            return Some(found);
        }
        // Cache miss: relist the base and probe only newly seen entries.
        let old: std::collections::HashSet<String> = cache.drain(..).collect();
        let listed: Vec<String> = std::fs::read_dir(&self.path)
            .ok()?
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        *cache = listed;
        self.search(
            cache.iter().map(String::as_str).filter(|n| !old.contains(*n)),
            gc_id,
        )
    }

    fn search<'a>(&self, names: impl Iterator<Item = &'a str>, gc_id: &str) -> Option<PathBuf> {
        for name in names {
            let candidate = self.path.join(name);
            if candidate.join(gc_id).exists() {
                return Some(candidate);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_is_created_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("deep/sandbox");
        let helper = SandboxHelper::new(&base).unwrap();
        assert!(base.is_dir());
        assert_eq!(helper.get_path(), base);
    }

    #[test]
    fn marker_file_is_found_through_relist() {
        let dir = tempfile::tempdir().unwrap();
        let helper = SandboxHelper::new(dir.path()).unwrap();
        assert_eq!(helper.get_sandbox("WMSID.TEST.1"), None);

        // A sandbox appearing after the first (cached) listing is still found.
        let sbx = dir.path().join("task.0001.abc");
        std::fs::create_dir(&sbx).unwrap();
        std::fs::File::create(sbx.join("WMSID.TEST.1")).unwrap();
        assert_eq!(helper.get_sandbox("WMSID.TEST.1"), Some(sbx.clone()));
        // Second lookup is served from the cache.
        assert_eq!(helper.get_sandbox("WMSID.TEST.1"), Some(sbx));
    }

    #[test]
    fn unknown_id_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let helper = SandboxHelper::new(dir.path()).unwrap();
        let sbx = dir.path().join("task.0002.def");
        std::fs::create_dir(&sbx).unwrap();
        std::fs::File::create(sbx.join("WMSID.TEST.2")).unwrap();
        assert_eq!(helper.get_sandbox("WMSID.TEST.9"), None);
    }
}

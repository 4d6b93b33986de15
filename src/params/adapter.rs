//! Stable job-number ↔ parameter-point mapping.
//!
//! The source tree enumerates *positions*; those shift whenever the tree
//! is restructured. The adapter pins each job number to a position plus
//! the tracked-content hash of its point, so the external identity of a
//! job survives resyncs: unchanged points keep their number, changed
//! points are flagged for redo, vanished points are disabled and fresh
//! positions get new numbers allocated monotonically.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::{debug, info};

use crate::error::{GcError, Result};
use crate::params::point::{ParameterMetadata, ParameterPoint};
use crate::params::source::{ParameterSource, ResyncResult};

const MAP_FILE: &str = "params.map";

#[derive(Debug, Clone)]
struct Binding {
    /// Position in the current tree; `None` once the point vanished.
    pnum: Option<u64>,
    /// Tracked-content hash recorded at bind time.
    hash: String,
}

#[derive(Debug)]
struct AdapterState {
    source: ParameterSource,
    metadata: Vec<ParameterMetadata>,
    bindings: BTreeMap<u64, Binding>,
}

#[derive(Debug)]
pub struct ParameterAdapter {
    inner: RwLock<AdapterState>,
    path: PathBuf,
}

impl ParameterAdapter {
    /// Wrap `source` and restore any previously persisted mapping from
    /// `work_dir`. Fresh positions are bound immediately and the mapping
    /// is written back out.
    pub fn new(source: ParameterSource, work_dir: &Path) -> Result<Self> {
        let mut metadata = Vec::new();
        source.fill_metadata(&mut metadata)?;
        let path = work_dir.join(MAP_FILE);
        let mut state = AdapterState {
            source,
            metadata,
            bindings: if path.exists() {
                load_bindings(&path)?
            } else {
                BTreeMap::new()
            },
        };
        bind_fresh_positions(&mut state);
        let adapter = ParameterAdapter {
            inner: RwLock::new(state),
            path,
        };
        adapter.persist()?;
        Ok(adapter)
    }

    /// Number of allocated job numbers (contiguous from zero, disabled
    /// ones included), or `None` over an inexhaustible tree.
    pub fn job_len(&self) -> Option<u64> {
        let state = self.inner.read().expect("adapter lock poisoned");
        state.source.parameter_len()?;
        Some(state.bindings.len() as u64)
    }

    pub fn job_metadata(&self) -> Vec<ParameterMetadata> {
        self.inner
            .read()
            .expect("adapter lock poisoned")
            .metadata
            .clone()
    }

    pub fn source_hash(&self) -> String {
        self.inner
            .read()
            .expect("adapter lock poisoned")
            .source
            .source_hash()
    }

    /// Current tree position of a job number, if it still exists.
    pub fn position_of(&self, jobnum: u64) -> Option<u64> {
        let state = self.inner.read().expect("adapter lock poisoned");
        match state.bindings.get(&jobnum) {
            Some(binding) => binding.pnum,
            // Inexhaustible trees carry no materialized bindings; job
            // numbers map straight onto positions.
            None if state.source.parameter_len().is_none() => Some(jobnum),
            None => None,
        }
    }

    /// The parameter point bound to `jobnum`. A job whose point vanished
    /// yields an inactive, empty point.
    pub fn job_content(&self, jobnum: u64) -> ParameterPoint {
        let state = self.inner.read().expect("adapter lock poisoned");
        let pnum = match state.bindings.get(&jobnum) {
            Some(binding) => binding.pnum,
            None if state.source.parameter_len().is_none() => Some(jobnum),
            None => None,
        };
        let mut point = ParameterPoint::new();
        match pnum {
            Some(pnum) => state.source.fill(pnum, &mut point),
            None => point.deactivate(),
        }
        point
    }

    /// Reconcile with changed underlying data and translate the outcome
    /// into job-number space. Readers observe either the full previous or
    /// the full new mapping, never a mix.
    ///
    /// A job number appearing in both returned sets ends up disabled:
    /// callers apply disables after redos.
    pub fn resync(&self) -> Result<ResyncResult> {
        let mut state = self.inner.write().expect("adapter lock poisoned");
        let tree_result = state.source.resync();
        let mut metadata = Vec::new();
        state.source.fill_metadata(&mut metadata)?;
        state.metadata = metadata;
        let new_len = state.source.parameter_len();

        let mut result = ResyncResult {
            size_changed: tree_result.size_changed,
            ..ResyncResult::default()
        };

        let metadata = state.metadata.clone();
        let AdapterState {
            source, bindings, ..
        } = &mut *state;
        for (jobnum, binding) in bindings.iter_mut() {
            let Some(pnum) = binding.pnum else {
                continue;
            };
            if let Some(len) = new_len
                && pnum >= len
            {
                // The tree shrank underneath this job.
                binding.pnum = None;
                result.disable.insert(*jobnum);
                continue;
            }
            if tree_result.disable.contains(&pnum) {
                binding.pnum = None;
                result.disable.insert(*jobnum);
                continue;
            }
            let mut point = ParameterPoint::new();
            source.fill(pnum, &mut point);
            let hash = point.tracked_hash(&metadata);
            if hash != binding.hash {
                binding.hash = hash;
                result.redo.insert(*jobnum);
            } else if tree_result.redo.contains(&pnum) {
                result.redo.insert(*jobnum);
            }
        }
        let fresh = bind_fresh_positions(&mut state);
        if fresh > 0 {
            info!(fresh, "allocated job numbers for new parameter points");
        }
        drop(state);

        self.persist()?;
        debug!(
            redo = result.redo.len(),
            disable = result.disable.len(),
            size_changed = result.size_changed,
            "parameter space resynced"
        );
        Ok(result)
    }

    /// Write the mapping with write-new-then-rename semantics.
    fn persist(&self) -> Result<()> {
        let state = self.inner.read().expect("adapter lock poisoned");
        if state.source.parameter_len().is_none() {
            return Ok(());
        }
        let dir = self
            .path
            .parent()
            .ok_or_else(|| GcError::Parameter("parameter map path has no parent".into()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| GcError::job("create parameter map temp file", e))?;
        for (jobnum, binding) in &state.bindings {
            let pnum = match binding.pnum {
                Some(pnum) => pnum.to_string(),
                None => "-".to_string(),
            };
            writeln!(tmp, "{jobnum}\t{pnum}\t{}", binding.hash)
                .map_err(|e| GcError::job("write parameter map", e))?;
        }
        tmp.as_file()
            .sync_all()
            .map_err(|e| GcError::job("sync parameter map", e))?;
        tmp.persist(&self.path)
            .map_err(|e| GcError::job("rename parameter map into place", e.error))?;
        Ok(())
    }
}

/// Bind every position that no job number points at yet; returns how many
/// fresh numbers were allocated.
fn bind_fresh_positions(state: &mut AdapterState) -> u64 {
    let Some(len) = state.source.parameter_len() else {
        return 0;
    };
    let bound: std::collections::BTreeSet<u64> =
        state.bindings.values().filter_map(|b| b.pnum).collect();
    let mut next = state
        .bindings
        .keys()
        .next_back()
        .map(|jobnum| jobnum + 1)
        .unwrap_or(0);
    let mut fresh = 0;
    for pnum in 0..len {
        if bound.contains(&pnum) {
            continue;
        }
        let mut point = ParameterPoint::new();
        state.source.fill(pnum, &mut point);
        let hash = point.tracked_hash(&state.metadata);
        state.bindings.insert(
            next,
            Binding {
                pnum: Some(pnum),
                hash,
            },
        );
        next += 1;
        fresh += 1;
    }
    fresh
}

fn load_bindings(path: &Path) -> Result<BTreeMap<u64, Binding>> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| GcError::job(format!("read parameter map {}", path.display()), e))?;
    let mut bindings = BTreeMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split('\t');
        let (jobnum, pnum, hash) = (parts.next(), parts.next(), parts.next());
        let (Some(jobnum), Some(pnum), Some(hash)) = (jobnum, pnum, hash) else {
            return Err(GcError::Parameter(format!(
                "malformed parameter map line: {line:?}"
            )));
        };
        let jobnum: u64 = jobnum
            .parse()
            .map_err(|_| GcError::Parameter(format!("bad job number in map: {jobnum:?}")))?;
        let pnum = match pnum {
            "-" => None,
            other => Some(other.parse().map_err(|_| {
                GcError::Parameter(format!("bad position in map: {other:?}"))
            })?),
        };
        bindings.insert(
            jobnum,
            Binding {
                pnum,
                hash: hash.to_string(),
            },
        );
    }
    Ok(bindings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::source::VarSource;
    use std::sync::Arc;

    fn shared_tree(
        values: &[&str],
    ) -> (Arc<std::sync::RwLock<Vec<String>>>, ParameterSource) {
        let store = Arc::new(std::sync::RwLock::new(
            values.iter().map(|v| v.to_string()).collect::<Vec<_>>(),
        ));
        let leaf = ParameterSource::leaf(Box::new(VarSource::shared("A", Arc::clone(&store))));
        (store, leaf)
    }

    #[test]
    fn unchanged_points_keep_their_job_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let (store, leaf) = shared_tree(&["x", "y", "z"]);
        let adapter = ParameterAdapter::new(leaf, dir.path()).unwrap();
        assert_eq!(adapter.job_len(), Some(3));

        store.write().unwrap()[1] = "other".to_string();
        let result = adapter.resync().unwrap();
        assert_eq!(result.redo, std::collections::BTreeSet::from([1]));
        assert!(result.disable.is_empty());
        // Positions of the untouched jobs are stable.
        assert_eq!(adapter.position_of(0), Some(0));
        assert_eq!(adapter.position_of(2), Some(2));
        assert_eq!(adapter.job_content(0).get("A"), Some("x"));
    }

    #[test]
    fn growth_allocates_monotonic_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let (store, leaf) = shared_tree(&["x", "y"]);
        let adapter = ParameterAdapter::new(leaf, dir.path()).unwrap();
        assert_eq!(adapter.job_len(), Some(2));

        store.write().unwrap().push("z".to_string());
        let result = adapter.resync().unwrap();
        assert!(result.size_changed);
        assert_eq!(adapter.job_len(), Some(3));
        assert_eq!(adapter.job_content(2).get("A"), Some("z"));
    }

    #[test]
    fn shrink_disables_orphans_but_keeps_numbers_allocated() {
        let dir = tempfile::tempdir().unwrap();
        let (store, leaf) = shared_tree(&["x", "y", "z"]);
        let adapter = ParameterAdapter::new(leaf, dir.path()).unwrap();

        store.write().unwrap().truncate(2);
        let result = adapter.resync().unwrap();
        assert!(result.disable.contains(&2));
        assert!(result.size_changed);
        // The number stays allocated; its point is gone.
        assert_eq!(adapter.job_len(), Some(3));
        assert_eq!(adapter.position_of(2), None);
        assert!(!adapter.job_content(2).is_active());
    }

    #[test]
    fn mapping_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let (store, leaf) = shared_tree(&["x", "y"]);
        {
            let adapter = ParameterAdapter::new(leaf, dir.path()).unwrap();
            store.write().unwrap().push("z".to_string());
            adapter.resync().unwrap();
        }
        // Rebuild over the already-grown data: job numbers come from disk.
        let fresh_leaf =
            ParameterSource::leaf(Box::new(VarSource::shared("A", Arc::clone(&store))));
        let reborn = ParameterAdapter::new(fresh_leaf, dir.path()).unwrap();
        assert_eq!(reborn.job_len(), Some(3));
        assert_eq!(reborn.position_of(2), Some(2));
        assert_eq!(reborn.job_content(2).get("A"), Some("z"));
    }

    #[test]
    fn resync_without_changes_reports_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, leaf) = shared_tree(&["x", "y"]);
        let adapter = ParameterAdapter::new(leaf, dir.path()).unwrap();
        let result = adapter.resync().unwrap();
        assert!(result.is_unchanged(), "got {result:?}");
    }

    #[test]
    fn zip_growth_marks_grown_rows_for_redo() {
        let dir = tempfile::tempdir().unwrap();
        let (store, a) = shared_tree(&["x", "y"]);
        let b = ParameterSource::var("B", &["1", "2", "3"]);
        let tree = ParameterSource::zip_long(vec![a, b]).unwrap();
        let adapter = ParameterAdapter::new(tree, dir.path()).unwrap();
        assert_eq!(adapter.job_len(), Some(3));

        store
            .write()
            .unwrap()
            .extend(["z".to_string(), "w".to_string()]);
        let result = adapter.resync().unwrap();
        assert!(result.size_changed);
        // Row 2 changes content (A joins in), row 3 is new.
        assert!(result.redo.contains(&2));
        assert_eq!(adapter.job_len(), Some(4));
        assert_eq!(adapter.job_content(3).get("A"), Some("w"));
    }
}

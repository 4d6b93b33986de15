//! Workload-management backends: requirement types, backend-qualified job
//! ids, flavor autodetection and the local dispatcher.

pub mod broker;
pub mod flavors;
pub mod local;

use std::ffi::OsStr;

use crate::error::{GcError, Result};

pub use broker::{Broker, UserBroker};
pub use flavors::LocalFlavor;
pub use local::{LocalWms, SubmitResult};

/// A single entry of a job's requirement list. Brokers append entries;
/// flavors translate them into submit arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Req {
    /// Wall-clock limit in seconds.
    WallTime(u64),
    /// CPU-time limit in seconds.
    CpuTime(u64),
    /// Requested cores, at least one.
    Cpus(u64),
    /// Memory in MB; negative means unset.
    Memory(i64),
    /// Acceptable execution sites.
    Sites(Vec<String>),
    /// Acceptable batch queues.
    Queues(Vec<String>),
}

/// Prefix of every backend-qualified job id.
pub const GC_ID_PREFIX: &str = "WMSID";

/// Compose `WMSID.<backend>.<raw>`. The backend name makes reverse sandbox
/// lookup unambiguous across differently flavored dispatchers.
pub fn create_gc_id(backend: &str, raw: &str) -> String {
    format!("{GC_ID_PREFIX}.{backend}.{raw}")
}

/// Split a backend-qualified id into `(backend, raw)`.
pub fn split_gc_id(gc_id: &str) -> Option<(&str, &str)> {
    gc_id
        .strip_prefix(GC_ID_PREFIX)?
        .strip_prefix('.')?
        .split_once('.')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Slurm,
    Oge,
    Pbs,
    Lsf,
    Jms,
}

impl BackendKind {
    pub fn alias(&self) -> &'static str {
        match self {
            BackendKind::Slurm => "SLURM",
            BackendKind::Oge => "OGE",
            BackendKind::Pbs => "PBS",
            BackendKind::Lsf => "LSF",
            BackendKind::Jms => "JMS",
        }
    }

    pub fn parse(name: &str) -> Option<BackendKind> {
        match name.to_uppercase().as_str() {
            "SLURM" => Some(BackendKind::Slurm),
            "OGE" | "SGE" | "GRIDENGINE" => Some(BackendKind::Oge),
            "PBS" => Some(BackendKind::Pbs),
            "LSF" => Some(BackendKind::Lsf),
            "JMS" => Some(BackendKind::Jms),
            _ => None,
        }
    }

    pub fn flavor(&self) -> Box<dyn LocalFlavor> {
        match self {
            BackendKind::Slurm => Box::new(flavors::SlurmFlavor),
            BackendKind::Oge => Box::new(flavors::OgeFlavor),
            BackendKind::Pbs => Box::new(flavors::PbsFlavor),
            BackendKind::Lsf => Box::new(flavors::LsfFlavor),
            BackendKind::Jms => Box::new(flavors::JmsFlavor),
        }
    }
}

/// Probe order for backend autodetection; the first executable found on
/// `PATH` decides.
const PROBE_TABLE: &[(&str, BackendKind)] = &[
    ("sacct", BackendKind::Slurm),
    ("sgepasswd", BackendKind::Oge),
    ("pbs-config", BackendKind::Pbs),
    ("qsub", BackendKind::Oge),
    ("bsub", BackendKind::Lsf),
    ("job_slurm", BackendKind::Jms),
];

/// Autodetect the local batch system from the current `PATH`.
pub fn detect_backend() -> Result<BackendKind> {
    detect_backend_in(None)
}

/// Autodetect against an explicit search path (used instead of `PATH`).
pub fn detect_backend_in(paths: Option<&OsStr>) -> Result<BackendKind> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| std::path::PathBuf::from("."));
    let mut failures = Vec::new();
    for (probe, kind) in PROBE_TABLE {
        let found = match paths {
            Some(paths) => which::which_in(probe, Some(paths), &cwd),
            None => which::which(probe),
        };
        match found {
            Ok(_) => return Ok(*kind),
            Err(e) => failures.push(format!("{probe}: {e}")),
        }
    }
    Err(GcError::Backend(format!(
        "no valid local backend found ({})",
        failures.join("; ")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn gc_id_roundtrips() {
        let gc_id = create_gc_id("TEST", "42");
        assert_eq!(gc_id, "WMSID.TEST.42");
        assert_eq!(split_gc_id(&gc_id), Some(("TEST", "42")));
        // Raw ids may themselves contain dots.
        assert_eq!(
            split_gc_id("WMSID.PBS.123.head.example"),
            Some(("PBS", "123.head.example"))
        );
        assert_eq!(split_gc_id("bogus"), None);
    }

    fn touch_exec(dir: &std::path::Path, name: &str) {
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn detect_picks_lsf_when_only_bsub_exists() {
        let dir = tempfile::tempdir().unwrap();
        touch_exec(dir.path(), "bsub");
        let kind = detect_backend_in(Some(dir.path().as_os_str())).unwrap();
        assert_eq!(kind, BackendKind::Lsf);
    }

    #[test]
    fn detect_prefers_sacct_over_qsub() {
        let dir = tempfile::tempdir().unwrap();
        touch_exec(dir.path(), "qsub");
        touch_exec(dir.path(), "sacct");
        let kind = detect_backend_in(Some(dir.path().as_os_str())).unwrap();
        assert_eq!(kind, BackendKind::Slurm);
    }

    #[test]
    fn detect_failure_names_every_probe() {
        let dir = tempfile::tempdir().unwrap();
        let err = detect_backend_in(Some(dir.path().as_os_str())).unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, GcError::Backend(_)), "got {err:?}");
        for (probe, _) in PROBE_TABLE {
            assert!(message.contains(probe), "{probe} missing from {message}");
        }
    }
}

//! The local dispatcher: submits jobs through an external batch
//! executable, retrieves outputs and cancels/purges sandboxes.

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{GcError, Result};
use crate::proc::LocalProcess;
use crate::sandbox::{PURGE_LOCK, SandboxHelper};
use crate::task::Task;
use crate::wms::broker::{Broker, create_broker};
use crate::wms::flavors::LocalFlavor;
use crate::wms::{BackendKind, Req, create_gc_id, detect_backend, split_gc_id};

/// Upper bound for one submit invocation; the child is terminated when it
/// is exceeded.
pub const SUBMIT_TIMEOUT: Duration = Duration::from_secs(20);

/// Grace granted to the backend to release sandbox file handles before
/// the purge starts deleting.
const PURGE_DELAY: Duration = Duration::from_secs(5);

/// How declared inputs reach the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferMode {
    Copy,
    Link,
}

/// Outcome of one submission attempt. A `None` id means the submission
/// failed at the backend; the sandbox is still recorded in `data`.
#[derive(Debug)]
pub struct SubmitResult {
    pub jobnum: u64,
    pub gc_id: Option<String>,
    pub data: BTreeMap<String, String>,
}

pub struct LocalWms {
    name: String,
    flavor: Box<dyn LocalFlavor>,
    sandbox_helper: SandboxHelper,
    scratch_paths: Vec<String>,
    submit_opts: Vec<String>,
    memory_floor: i64,
    site_broker: Box<dyn Broker>,
    queue_broker: Box<dyn Broker>,
    launcher: PathBuf,
    transfer_mode: TransferMode,
    wait_idle: u64,
    wait_work: u64,
    pub(crate) submit_timeout: Duration,
}

impl LocalWms {
    /// The `Local` facade: use the configured backend name, or probe the
    /// `PATH` for a known batch system.
    pub fn create(config: &Config) -> Result<LocalWms> {
        let kind = match &config.wms {
            Some(name) => BackendKind::parse(name).ok_or_else(|| {
                GcError::Config(format!("unable to load backend {name:?}"))
            })?,
            None => detect_backend()?,
        };
        Self::with_flavor(config, kind.flavor())
    }

    pub fn with_flavor(config: &Config, flavor: Box<dyn LocalFlavor>) -> Result<LocalWms> {
        let sandbox_helper = SandboxHelper::new(&config.sandbox_base())?;
        let transfer_mode = match config.input_transfer.as_str() {
            "copy" => TransferMode::Copy,
            "link" | "symlink" => TransferMode::Link,
            other => {
                return Err(GcError::Config(format!(
                    "unknown input transfer mode: {other:?}"
                )));
            }
        };
        Ok(LocalWms {
            name: flavor.name().to_string(),
            sandbox_helper,
            scratch_paths: config.scratch_path.clone(),
            submit_opts: config
                .submit_options
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            memory_floor: config.memory,
            site_broker: create_broker(
                &config.site_broker,
                config.sites.clone(),
                Vec::new(),
                true,
            )?,
            queue_broker: create_broker(
                &config.queue_broker,
                Vec::new(),
                config.queues.clone(),
                false,
            )?,
            launcher: config.launcher.clone().unwrap_or_else(default_launcher),
            transfer_mode,
            wait_idle: config.wait_idle,
            wait_work: config.wait_work,
            submit_timeout: SUBMIT_TIMEOUT,
            flavor,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sandbox_helper(&self) -> &SandboxHelper {
        &self.sandbox_helper
    }

    /// Seconds to sleep when no work is pending / between work batches.
    pub fn pacing(&self) -> (u64, u64) {
        (self.wait_idle, self.wait_work)
    }

    /// Submit one job: allocate a sandbox, stage inputs, write the job
    /// config, broker the requirements and run the submit executable.
    ///
    /// Backend-level failures (non-zero exit, unparseable output, timeout)
    /// yield `gc_id: None` and a warning; only sandbox setup failures are
    /// raised.
    pub fn submit_job(&self, jobnum: u64, task: &Task) -> Result<SubmitResult> {
        let base = self.sandbox_helper.get_path();
        let sandbox = tempfile::Builder::new()
            .prefix(&format!("{}.{:04}.", task.task_id(), jobnum))
            .tempdir_in(base)
            .map_err(|e| {
                GcError::Backend(format!(
                    "unable to create sandbox directory under {}: {e}",
                    base.display()
                ))
            })?
            .keep();
        debug!(jobnum, sandbox = %sandbox.display(), "sandbox allocated");

        let sandbox_prefix = sandbox
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.stage_inputs(task, &sandbox, &sandbox_prefix)?;

        let mut env = task.job_environment(jobnum);
        env.insert("GC_SANDBOX".to_string(), sandbox.display().to_string());
        env.insert(
            "GC_SCRATCH_SEARCH".to_string(),
            self.scratch_paths.join(" "),
        );
        write_job_config(&sandbox.join("_jobconfig.sh"), &env)?;

        let mut reqs = self.site_broker.broker_add(task.requirements(jobnum));
        reqs = self.queue_broker.broker_add(reqs);
        apply_memory_floor(&mut reqs, self.memory_floor);

        let stdout = sandbox.join("gc.stdout");
        let stderr = sandbox.join("gc.stderr");
        let job_name = task.job_name(jobnum)?;

        let mut args = self.submit_opts.clone();
        args.extend(self.flavor.submit_arguments(
            jobnum, &job_name, &reqs, &sandbox, &stdout, &stderr,
        ));
        args.push(self.launcher.display().to_string());
        args.extend(self.flavor.job_arguments(jobnum, &sandbox));

        let mut data = BTreeMap::new();
        data.insert("sandbox".to_string(), sandbox.display().to_string());

        let mut proc = match LocalProcess::spawn(self.flavor.submit_exec(), &args) {
            Ok(proc) => proc,
            Err(e) => {
                warn!(jobnum, %e, "unable to run submit executable");
                return Ok(SubmitResult {
                    jobnum,
                    gc_id: None,
                    data,
                });
            }
        };
        let exit = proc.status_or_terminate(self.submit_timeout);
        let output = proc.stdout.read_str(Duration::ZERO);
        let raw_id = self
            .flavor
            .parse_submit_output(output.trim())
            .filter(|raw| !raw.is_empty());

        let gc_id = match (&exit, raw_id) {
            (Some(status), Some(raw)) if status.success() => {
                let gc_id = create_gc_id(&self.name, &raw);
                // Reverse-lookup marker: an empty file named like the id.
                std::fs::File::create(sandbox.join(&gc_id)).map_err(|e| {
                    GcError::Backend(format!(
                        "unable to create sandbox marker for job {jobnum}: {e}"
                    ))
                })?;
                info!(jobnum, %gc_id, "job submitted");
                Some(gc_id)
            }
            (Some(status), _) if !status.success() => {
                warn!(
                    jobnum,
                    %status,
                    stderr = %proc.stderr.read_str(Duration::ZERO).trim(),
                    "{} failed", self.flavor.submit_exec()
                );
                None
            }
            (None, _) => {
                warn!(jobnum, "{} timed out and was terminated", self.flavor.submit_exec());
                None
            }
            _ => {
                warn!(
                    jobnum,
                    output = %output.trim(),
                    "{} did not yield a job id", self.flavor.submit_exec()
                );
                None
            }
        };

        Ok(SubmitResult {
            jobnum,
            gc_id,
            data,
        })
    }

    fn stage_inputs(&self, task: &Task, sandbox: &Path, sandbox_prefix: &str) -> Result<()> {
        for file in task.sb_in_files() {
            let target = sandbox.join(&file.path_rel);
            debug!(
                source = %file.path_abs.display(),
                target = %format!("{sandbox_prefix}/{}", file.path_rel),
                "staging input"
            );
            let staged = match self.transfer_mode {
                TransferMode::Copy => std::fs::copy(&file.path_abs, &target).map(|_| ()),
                TransferMode::Link => std::os::unix::fs::symlink(&file.path_abs, &target),
            };
            staged.map_err(|e| {
                GcError::Backend(format!(
                    "unable to stage input {} into sandbox: {e}",
                    file.path_abs.display()
                ))
            })?;
        }
        Ok(())
    }

    /// Locate the sandbox of each job and prune everything that does not
    /// match a declared output pattern. A missing sandbox yields `None`.
    pub fn retrieve_outputs(
        &self,
        ids: &[(String, u64)],
        output_patterns: &[String],
    ) -> Vec<(u64, Option<PathBuf>)> {
        let mut results = Vec::with_capacity(ids.len());
        for (gc_id, jobnum) in ids {
            let Some(path) = self.sandbox_helper.get_sandbox(gc_id) else {
                results.push((*jobnum, None));
                continue;
            };
            let mut keep: HashSet<PathBuf> = HashSet::new();
            for pattern in output_patterns {
                let full = path.join(pattern);
                if let Ok(matches) = glob::glob(&full.to_string_lossy()) {
                    keep.extend(matches.flatten());
                }
            }
            if let Ok(entries) = std::fs::read_dir(&path) {
                for entry in entries.flatten() {
                    let entry_path = entry.path();
                    if keep.contains(&entry_path) {
                        continue;
                    }
                    let removed = if entry_path.is_dir() {
                        std::fs::remove_dir_all(&entry_path)
                    } else {
                        std::fs::remove_file(&entry_path)
                    };
                    if let Err(e) = removed {
                        warn!(path = %entry_path.display(), %e, "unable to prune sandbox entry");
                    }
                }
            }
            results.push((*jobnum, Some(path)));
        }
        results
    }

    /// Cancel jobs at the backend, then purge their sandboxes.
    pub fn cancel_jobs(&self, ids: &[(String, u64)]) -> Result<Vec<u64>> {
        let mut raw_ids = Vec::new();
        let mut jobnums = Vec::new();
        for (gc_id, jobnum) in ids {
            match split_gc_id(gc_id) {
                Some((_, raw)) => {
                    raw_ids.push(raw.to_string());
                    jobnums.push(*jobnum);
                }
                None => warn!(%gc_id, "malformed backend id, skipping cancel"),
            }
        }
        if !raw_ids.is_empty() {
            match LocalProcess::spawn(self.flavor.cancel_exec(), &raw_ids) {
                Ok(proc) => {
                    let status = proc.status_or_terminate(self.submit_timeout);
                    if !status.as_ref().is_some_and(|s| s.success()) {
                        warn!(?status, "{} reported failure", self.flavor.cancel_exec());
                    }
                }
                Err(e) => warn!(%e, "unable to run cancel executable"),
            }
        }
        self.purge_jobs(&raw_ids)?;
        Ok(jobnums)
    }

    /// Remove the sandboxes of the given raw backend ids.
    pub fn purge_jobs(&self, raw_ids: &[String]) -> Result<Vec<String>> {
        purge_sandboxes(&self.sandbox_helper, &self.name, raw_ids, PURGE_DELAY)
    }
}

/// Purge executor: waits for the backend to let go of its file handles,
/// then deletes each sandbox under the process-wide purge lock. A missing
/// sandbox is a warning; a failed delete surfaces as a backend error
/// naming the job and path, with the lock released.
fn purge_sandboxes(
    helper: &SandboxHelper,
    wms_name: &str,
    raw_ids: &[String],
    delay: Duration,
) -> Result<Vec<String>> {
    if raw_ids.is_empty() {
        return Ok(Vec::new());
    }
    std::thread::sleep(delay);
    let mut purged = Vec::new();
    for raw in raw_ids {
        let gc_id = create_gc_id(wms_name, raw);
        let Some(path) = helper.get_sandbox(&gc_id) else {
            warn!(%raw, "sandbox for job could not be found");
            continue;
        };
        let guard = PURGE_LOCK.lock().expect("purge lock poisoned");
        if let Err(e) = std::fs::remove_dir_all(&path) {
            drop(guard);
            return Err(GcError::Backend(format!(
                "sandbox for job {raw:?} could not be deleted ({}): {e}",
                path.display()
            )));
        }
        drop(guard);
        debug!(%raw, path = %path.display(), "sandbox purged");
        purged.push(raw.clone());
    }
    Ok(purged)
}

/// Raise any configured memory request below the floor up to the floor.
fn apply_memory_floor(reqs: &mut Vec<Req>, floor: i64) {
    if floor <= 0 {
        return;
    }
    for req in reqs.iter_mut() {
        if let Req::Memory(mb) = req {
            if *mb < floor {
                *mb = floor;
            }
            return;
        }
    }
    reqs.push(Req::Memory(floor));
}

/// Write the `KEY='VALUE'` environment script sourced by the launcher.
fn write_job_config(path: &Path, env: &BTreeMap<String, String>) -> Result<()> {
    let mut out = String::from("# gridrun job configuration\n");
    for (key, value) in env {
        out.push_str(&format!("export {key}='{}'\n", value.replace('\'', r"'\''")));
    }
    let mut file = std::fs::File::create(path).map_err(|e| {
        GcError::Backend(format!("unable to write job config {}: {e}", path.display()))
    })?;
    file.write_all(out.as_bytes()).map_err(|e| {
        GcError::Backend(format!("unable to write job config {}: {e}", path.display()))
    })
}

fn default_launcher() -> PathBuf {
    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        let candidate = dir.join("share").join("gc-local.sh");
        if candidate.exists() {
            return candidate;
        }
    }
    PathBuf::from("share/gc-local.sh")
}

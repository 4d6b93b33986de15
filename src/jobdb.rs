//! Per-job state records, bulk selectors and the on-disk job database.
//!
//! Each job is one line-oriented `key=value` file under the work
//! directory (`jobs/job_<n>.txt`); commits are atomic per job via
//! write-temp, fsync, rename. Distinct job numbers are not serialized
//! against each other.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::error::{GcError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobState {
    Init,
    Submitted,
    Disabled,
    Ready,
    Waiting,
    Queued,
    Aborted,
    Running,
    Cancel,
    Unknown,
    Cancelled,
    Done,
    Failed,
    Success,
}

impl JobState {
    pub fn name(&self) -> &'static str {
        match self {
            JobState::Init => "INIT",
            JobState::Submitted => "SUBMITTED",
            JobState::Disabled => "DISABLED",
            JobState::Ready => "READY",
            JobState::Waiting => "WAITING",
            JobState::Queued => "QUEUED",
            JobState::Aborted => "ABORTED",
            JobState::Running => "RUNNING",
            JobState::Cancel => "CANCEL",
            JobState::Unknown => "UNKNOWN",
            JobState::Cancelled => "CANCELLED",
            JobState::Done => "DONE",
            JobState::Failed => "FAILED",
            JobState::Success => "SUCCESS",
        }
    }

    pub fn parse(name: &str) -> Option<JobState> {
        match name {
            "INIT" => Some(JobState::Init),
            "SUBMITTED" => Some(JobState::Submitted),
            "DISABLED" => Some(JobState::Disabled),
            "READY" => Some(JobState::Ready),
            "WAITING" => Some(JobState::Waiting),
            "QUEUED" => Some(JobState::Queued),
            "ABORTED" => Some(JobState::Aborted),
            "RUNNING" => Some(JobState::Running),
            "CANCEL" => Some(JobState::Cancel),
            "UNKNOWN" => Some(JobState::Unknown),
            "CANCELLED" => Some(JobState::Cancelled),
            "DONE" => Some(JobState::Done),
            "FAILED" => Some(JobState::Failed),
            "SUCCESS" => Some(JobState::Success),
            _ => None,
        }
    }

    /// Terminal states never transition further.
    pub fn is_terminal(&self) -> bool {
        JobClass::ENDSTATE.contains(*self) || JobClass::FAILING.contains(*self)
    }
}

/// A bulk selector over job states; predicates stay pure functions of the
/// job record.
#[derive(Debug, Clone, Copy)]
pub struct JobClass(&'static [JobState]);

impl JobClass {
    pub const ATWMS: JobClass = JobClass(&[
        JobState::Submitted,
        JobState::Waiting,
        JobState::Ready,
        JobState::Queued,
        JobState::Unknown,
    ]);
    pub const CANCEL: JobClass = JobClass(&[JobState::Cancel]);
    pub const DISABLED: JobClass = JobClass(&[JobState::Disabled]);
    pub const DONE: JobClass = JobClass(&[JobState::Done]);
    pub const ENDSTATE: JobClass = JobClass(&[JobState::Success, JobState::Disabled]);
    pub const PROCESSED: JobClass = JobClass(&[
        JobState::Success,
        JobState::Failed,
        JobState::Cancelled,
        JobState::Aborted,
    ]);
    pub const PROCESSING: JobClass = JobClass(&[
        JobState::Submitted,
        JobState::Waiting,
        JobState::Ready,
        JobState::Queued,
        JobState::Unknown,
        JobState::Running,
    ]);
    pub const RUNNING_DONE: JobClass = JobClass(&[JobState::Running, JobState::Done]);
    pub const FAILING: JobClass = JobClass(&[
        JobState::Failed,
        JobState::Aborted,
        JobState::Cancelled,
    ]);
    pub const SUBMIT_CANDIDATES: JobClass = JobClass(&[
        JobState::Init,
        JobState::Failed,
        JobState::Aborted,
        JobState::Cancelled,
    ]);
    pub const SUCCESS: JobClass = JobClass(&[JobState::Success]);

    pub fn contains(&self, state: JobState) -> bool {
        self.0.contains(&state)
    }

    pub fn states(&self) -> &'static [JobState] {
        self.0
    }
}

/// Predicate used to filter job iteration.
pub type JobSelector = Box<dyn Fn(u64, &Job) -> bool + Send + Sync>;

/// Selector matching every job whose state is in `class`.
pub fn class_selector(class: JobClass) -> JobSelector {
    Box::new(move |_jobnum, job| class.contains(job.state))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// One job record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub state: JobState,
    pub attempt: u32,
    /// Backend-qualified id (`WMSID.<backend>.<raw>`), set on submission.
    pub gc_id: Option<String>,
    pub submitted: u64,
    pub changed: u64,
    /// Submission destination per attempt.
    pub history: BTreeMap<u32, String>,
    dict: BTreeMap<String, String>,
}

impl Default for Job {
    fn default() -> Self {
        Job::new()
    }
}

impl Job {
    pub fn new() -> Self {
        Job {
            state: JobState::Init,
            attempt: 0,
            gc_id: None,
            submitted: 0,
            changed: 0,
            history: BTreeMap::new(),
            dict: BTreeMap::new(),
        }
    }

    /// Record a successful hand-off to the backend: bumps the attempt
    /// counter and stamps the submission time.
    pub fn assign_id(&mut self, gc_id: impl Into<String>) {
        self.gc_id = Some(gc_id.into());
        self.attempt += 1;
        self.submitted = now_secs();
    }

    /// Transition to `state`, stamping the change time and snapshotting
    /// the current destination into the per-attempt history.
    pub fn update(&mut self, state: JobState) {
        self.state = state;
        self.changed = now_secs();
        let dest = self
            .dict
            .get("dest")
            .cloned()
            .unwrap_or_else(|| "N/A".to_string());
        self.history.insert(self.attempt, dest);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.dict.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.dict.insert(key.into(), value.into());
    }

    pub fn dict(&self) -> &BTreeMap<String, String> {
        &self.dict
    }

    /// Line-oriented `key=value` rendering for the job file.
    fn render(&self) -> String {
        let mut out = String::new();
        if let Some(gc_id) = &self.gc_id {
            out.push_str(&format!("id={gc_id}\n"));
        }
        out.push_str(&format!("status={}\n", self.state.name()));
        out.push_str(&format!("attempt={}\n", self.attempt));
        out.push_str(&format!("submitted={}\n", self.submitted));
        out.push_str(&format!("changed={}\n", self.changed));
        for (attempt, dest) in &self.history {
            out.push_str(&format!("history.{attempt}={dest}\n"));
        }
        for (key, value) in &self.dict {
            out.push_str(&format!("{key}={value}\n"));
        }
        out
    }

    fn parse(contents: &str) -> Result<Job> {
        let mut job = Job::new();
        for line in contents.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(GcError::Config(format!("malformed job record line: {line:?}")));
            };
            match key {
                "id" => job.gc_id = Some(value.to_string()),
                "status" => {
                    job.state = JobState::parse(value).ok_or_else(|| {
                        GcError::Config(format!("unknown job state: {value:?}"))
                    })?;
                }
                "attempt" => {
                    job.attempt = value.parse().map_err(|_| {
                        GcError::Config(format!("bad attempt count: {value:?}"))
                    })?;
                }
                "submitted" => job.submitted = value.parse().unwrap_or(0),
                "changed" => job.changed = value.parse().unwrap_or(0),
                _ => {
                    if let Some(attempt) = key.strip_prefix("history.") {
                        if let Ok(attempt) = attempt.parse::<u32>() {
                            job.history.insert(attempt, value.to_string());
                            continue;
                        }
                    }
                    job.dict.insert(key.to_string(), value.to_string());
                }
            }
        }
        Ok(job)
    }
}

/// The persistent job database: one record file per job number.
pub struct JobDb {
    path: PathBuf,
    job_limit: std::sync::atomic::AtomicI64,
    always_selector: Option<JobSelector>,
}

impl JobDb {
    /// Open (or create) the database below `work_dir`. `job_limit` bounds
    /// the iterated job-number space; a negative limit means empty until
    /// [`JobDb::set_limit`] is called. The optional `always_selector` is
    /// AND-composed with every per-call selector.
    pub fn new(
        work_dir: &Path,
        job_limit: i64,
        always_selector: Option<JobSelector>,
    ) -> Result<Self> {
        let path = work_dir.join("jobs");
        std::fs::create_dir_all(&path)
            .map_err(|e| GcError::job(format!("create job dir {}", path.display()), e))?;
        Ok(JobDb {
            path,
            job_limit: std::sync::atomic::AtomicI64::new(job_limit),
            always_selector,
        })
    }

    pub fn work_path(&self) -> &Path {
        &self.path
    }

    pub fn job_limit(&self) -> i64 {
        self.job_limit.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn set_limit(&self, limit: i64) {
        self.job_limit
            .store(limit, std::sync::atomic::Ordering::SeqCst);
    }

    fn job_file(&self, jobnum: u64) -> PathBuf {
        self.path.join(format!("job_{jobnum}.txt"))
    }

    /// Load the last committed record of `jobnum`, or a fresh `INIT`
    /// record if none was ever committed.
    pub fn get(&self, jobnum: u64) -> Result<Job> {
        let file = self.job_file(jobnum);
        match std::fs::read_to_string(&file) {
            Ok(contents) => Job::parse(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Job::new()),
            Err(e) => Err(GcError::job(format!("read {}", file.display()), e)),
        }
    }

    /// Atomically write the record of `jobnum`.
    pub fn commit(&self, jobnum: u64, job: &Job) -> Result<()> {
        let file = self.job_file(jobnum);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.path)
            .map_err(|e| GcError::job("create job record temp file", e))?;
        tmp.write_all(job.render().as_bytes())
            .map_err(|e| GcError::job(format!("write record for job {jobnum}"), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| GcError::job(format!("sync record for job {jobnum}"), e))?;
        tmp.persist(&file)
            .map_err(|e| GcError::job(format!("rename {} into place", file.display()), e.error))?;
        debug!(jobnum, state = job.state.name(), "job committed");
        Ok(())
    }

    /// Lazily iterate matching job numbers; `subset` restricts the
    /// candidate numbers, otherwise the whole `0..limit` space is walked.
    pub fn iter_jobs<'a>(
        &'a self,
        selector: Option<&'a JobSelector>,
        subset: Option<Vec<u64>>,
    ) -> impl Iterator<Item = u64> + 'a {
        let candidates: Vec<u64> = match subset {
            Some(subset) => subset,
            None => (0..self.job_limit().max(0) as u64).collect(),
        };
        candidates.into_iter().filter(move |jobnum| {
            if selector.is_none() && self.always_selector.is_none() {
                return true;
            }
            let Ok(job) = self.get(*jobnum) else {
                return false;
            };
            selector.is_none_or(|s| s(*jobnum, &job))
                && self
                    .always_selector
                    .as_ref()
                    .is_none_or(|s| s(*jobnum, &job))
        })
    }

    pub fn job_len(&self, selector: Option<&JobSelector>, subset: Option<Vec<u64>>) -> usize {
        self.iter_jobs(selector, subset).count()
    }
}

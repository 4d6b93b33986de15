//! gridrun — entry point.
//!
//! All stdout is JSON only. Tracing logs go to stderr.

use std::path::Path;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use gridrun::config::Config;
use gridrun::error::GcError;
use gridrun::jobdb::{JobClass, JobDb, JobState, class_selector};
use gridrun::task::Task;
use gridrun::wms::{LocalWms, detect_backend};

#[derive(Debug, Parser)]
#[command(name = "gridrun")]
#[command(about = "Batch-job orchestrator for scientific workloads", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to the task configuration file (TOML).
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Submit pending jobs to the configured backend.
    Submit {
        /// Cap the number of submission attempts in this invocation.
        #[arg(long)]
        limit: Option<u64>,
    },

    /// Show a per-state summary of the job database.
    Status,

    /// Re-evaluate the parameter space and apply redo/disable decisions.
    Resync,

    /// Retrieve outputs of submitted jobs.
    Output,

    /// Cancel jobs currently at the backend and purge their sandboxes.
    Cancel,

    /// Report which local backend would be used.
    Detect,
}

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    // Logs always go to stderr so stdout remains JSON-only.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    if let Err(e) = run(cli) {
        let code = e
            .downcast_ref::<GcError>()
            .map(GcError::code)
            .unwrap_or("internal_error");
        println!(
            "{}",
            json!({
                "ok": false,
                "type": "error",
                "error": { "code": code, "message": format!("{e:#}") },
            })
        );
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref().map(Path::new))?;
    match cli.command {
        Command::Submit { limit } => submit(&config, limit),
        Command::Status => status(&config),
        Command::Resync => resync(&config),
        Command::Output => output(&config),
        Command::Cancel => cancel(&config),
        Command::Detect => {
            let kind = detect_backend()?;
            print_json(json!({ "ok": true, "type": "detect", "backend": kind.alias() }));
            Ok(())
        }
    }
}

fn build_task(config: &Config) -> Result<(Task, JobDb)> {
    let source = config.parameter_source()?;
    let task = Task::new(config, source)?;
    task.validate_variables()?;
    let limit = task.job_len().map(|len| len as i64).unwrap_or(-1);
    let db = JobDb::new(&config.work_path(), limit, None)?;
    Ok((task, db))
}

fn submit(config: &Config, limit: Option<u64>) -> Result<()> {
    let (task, db) = build_task(config)?;
    let wms = LocalWms::create(config)?;

    let selector = class_selector(JobClass::SUBMIT_CANDIDATES);
    let candidates: Vec<u64> = db.iter_jobs(Some(&selector), None).collect();

    let mut submitted = 0u64;
    let mut failed = 0u64;
    let mut jobs = Vec::new();
    for jobnum in candidates {
        if let Some(cap) = limit
            && submitted + failed >= cap
        {
            break;
        }
        if !task.can_submit(jobnum) {
            continue;
        }
        let result = wms.submit_job(jobnum, &task)?;
        let mut job = db.get(jobnum)?;
        if let Some(sandbox) = result.data.get("sandbox") {
            job.set("sandbox", sandbox.clone());
        }
        match &result.gc_id {
            Some(gc_id) => {
                job.assign_id(gc_id.clone());
                job.set("dest", wms.name());
                job.update(JobState::Submitted);
                submitted += 1;
            }
            None => {
                // A failed submission leaves the job state untouched; the
                // user simply retries.
                failed += 1;
            }
        }
        db.commit(jobnum, &job)?;
        jobs.push(json!({ "job": jobnum, "gc_id": result.gc_id }));
    }

    print_json(json!({
        "ok": true,
        "type": "submit",
        "backend": wms.name(),
        "submitted": submitted,
        "failed": failed,
        "jobs": jobs,
    }));
    Ok(())
}

fn status(config: &Config) -> Result<()> {
    let (task, db) = build_task(config)?;
    let mut states: std::collections::BTreeMap<&'static str, u64> =
        std::collections::BTreeMap::new();
    let total = db.job_len(None, None) as u64;
    for jobnum in db.iter_jobs(None, None).collect::<Vec<_>>() {
        let job = db.get(jobnum)?;
        *states.entry(job.state.name()).or_insert(0) += 1;
    }
    print_json(json!({
        "ok": true,
        "type": "status",
        "task_id": task.task_id(),
        "jobs": total,
        "states": states,
    }));
    Ok(())
}

fn resync(config: &Config) -> Result<()> {
    let (task, db) = build_task(config)?;
    let result = task.get_intervention()?;

    // Redo first: jobs at the backend are asked to cancel, settled jobs
    // return to INIT for resubmission.
    for jobnum in &result.redo {
        let mut job = db.get(*jobnum)?;
        if JobClass::PROCESSING.contains(job.state) {
            job.update(JobState::Cancel);
        } else if job.state != JobState::Init {
            job.update(JobState::Init);
        }
        db.commit(*jobnum, &job)?;
    }
    // Disables are applied after redos and win over them.
    for jobnum in &result.disable {
        let mut job = db.get(*jobnum)?;
        job.update(JobState::Disabled);
        db.commit(*jobnum, &job)?;
    }
    if result.size_changed
        && let Some(len) = task.job_len()
    {
        db.set_limit(len as i64);
    }

    print_json(json!({
        "ok": true,
        "type": "resync",
        "redo": result.redo,
        "disable": result.disable,
        "size_changed": result.size_changed,
    }));
    Ok(())
}

fn output(config: &Config) -> Result<()> {
    let (task, db) = build_task(config)?;
    let wms = LocalWms::create(config)?;

    let mut ids = Vec::new();
    for jobnum in db.iter_jobs(None, None).collect::<Vec<_>>() {
        let job = db.get(jobnum)?;
        if let Some(gc_id) = job.gc_id {
            ids.push((gc_id, jobnum));
        }
    }
    let mut jobs = Vec::new();
    for (jobnum, path) in wms.retrieve_outputs(&ids, task.sb_out_files()) {
        match path {
            Some(path) => {
                let mut job = db.get(jobnum)?;
                job.set("output", path.display().to_string());
                db.commit(jobnum, &job)?;
                jobs.push(json!({ "job": jobnum, "path": path.display().to_string() }));
            }
            None => {
                warn!(jobnum, "sandbox is gone, no output to retrieve");
                jobs.push(json!({ "job": jobnum, "path": serde_json::Value::Null }));
            }
        }
    }
    print_json(json!({ "ok": true, "type": "output", "jobs": jobs }));
    Ok(())
}

fn cancel(config: &Config) -> Result<()> {
    let (_task, db) = build_task(config)?;
    let wms = LocalWms::create(config)?;

    let selector = class_selector(JobClass::PROCESSING);
    let mut ids = Vec::new();
    for jobnum in db.iter_jobs(Some(&selector), None).collect::<Vec<_>>() {
        let job = db.get(jobnum)?;
        if let Some(gc_id) = job.gc_id {
            ids.push((gc_id, jobnum));
        }
    }
    let cancelled = wms.cancel_jobs(&ids)?;
    for jobnum in &cancelled {
        let mut job = db.get(*jobnum)?;
        job.update(JobState::Cancelled);
        db.commit(*jobnum, &job)?;
    }
    print_json(json!({ "ok": true, "type": "cancel", "cancelled": cancelled }));
    Ok(())
}

fn print_json(value: serde_json::Value) {
    println!("{value}");
}

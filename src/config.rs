//! Configuration surface consumed by the core.
//!
//! Options load from a TOML file; unknown keys are tolerated. Resolution
//! of the work directory follows the priority chain CLI/config value,
//! `GRIDRUN_WORK` environment variable, then the platform data dir.

use std::path::{Path, PathBuf};

use directories::BaseDirs;
use serde::Deserialize;

use crate::error::{GcError, Result};
use crate::params::source::{ParameterSource, VarSource};

/// One parameter axis of the task's parameter space.
#[derive(Debug, Clone, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub values: Vec<String>,
    #[serde(default)]
    pub untracked: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Work directory holding job records and the parameter map.
    pub working_dir: Option<PathBuf>,
    /// Base directory for per-job sandboxes.
    pub sandbox_path: Option<PathBuf>,
    /// Ordered scratch search list, injected as `GC_SCRATCH_SEARCH`.
    pub scratch_path: Vec<String>,
    /// Verbatim extra arguments prepended to every submit invocation.
    pub submit_options: String,
    /// Per-job memory floor in MB; negative disables the floor.
    pub memory: i64,
    /// Dispatcher pacing in seconds.
    pub wait_idle: u64,
    pub wait_work: u64,
    /// Per-job requirements. `wall_time` is mandatory for task creation.
    pub wall_time: Option<String>,
    pub cpu_time: Option<String>,
    pub cpus: u64,
    pub node_timeout: i64,
    /// Sandbox manifest.
    pub input_files: Vec<PathBuf>,
    pub output_files: Vec<String>,
    /// How declared inputs reach the sandbox: "copy" or "link".
    pub input_transfer: String,
    pub gzip_output: bool,
    /// Declared runtime dependencies, matched case-insensitively.
    pub depends: Vec<String>,
    /// Files whose content undergoes variable substitution.
    pub subst_files: Vec<String>,
    /// Broker plugin names and their user-supplied constraints.
    pub site_broker: String,
    pub queue_broker: String,
    pub sites: Vec<String>,
    pub queues: Vec<String>,
    /// Explicit backend name; unset means autodetection.
    pub wms: Option<String>,
    pub task_id: Option<String>,
    pub task_date: Option<String>,
    /// Job name template, `@…@`-substituted per job.
    pub job_name: String,
    /// The user command.
    pub executable: Option<String>,
    pub arguments: Vec<String>,
    /// ROOT installation; enables the ROOT command wrapper.
    pub root_path: Option<PathBuf>,
    /// Launcher script handed to the submit executable.
    pub launcher: Option<PathBuf>,
    /// Storage limits exported to the job environment.
    pub se_min_size: i64,
    pub scratch_space_used: i64,
    pub scratch_space_left: i64,
    pub landing_zone_space_used: i64,
    pub landing_zone_space_left: i64,
    /// Parameter space: the cross product of all axes, repeated.
    pub parameter: Vec<ParamSpec>,
    pub repeat: i64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            working_dir: None,
            sandbox_path: None,
            scratch_path: vec!["TMPDIR".to_string(), "/tmp".to_string()],
            submit_options: String::new(),
            memory: -1,
            wait_idle: 20,
            wait_work: 5,
            wall_time: None,
            cpu_time: None,
            cpus: 1,
            node_timeout: -1,
            input_files: Vec::new(),
            output_files: Vec::new(),
            input_transfer: "copy".to_string(),
            gzip_output: true,
            depends: Vec::new(),
            subst_files: Vec::new(),
            site_broker: "UserBroker".to_string(),
            queue_broker: "UserBroker".to_string(),
            sites: Vec::new(),
            queues: Vec::new(),
            wms: None,
            task_id: None,
            task_date: None,
            job_name: "@GC_TASK_ID@.@GC_JOB_ID@".to_string(),
            executable: None,
            arguments: Vec::new(),
            root_path: None,
            launcher: None,
            se_min_size: -1,
            scratch_space_used: 5000,
            scratch_space_left: 1,
            landing_zone_space_used: 100,
            landing_zone_space_left: 1,
            parameter: Vec::new(),
            repeat: 1,
        }
    }
}

impl Config {
    /// Load from a TOML file, or fall back to defaults without one.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path).map_err(|e| {
                    GcError::Config(format!("unable to read {}: {e}", path.display()))
                })?;
                toml::from_str(&contents).map_err(|e| {
                    GcError::Config(format!("unable to parse {}: {e}", path.display()))
                })
            }
            None => Ok(Config::default()),
        }
    }

    /// Resolve the work directory.
    pub fn work_path(&self) -> PathBuf {
        if let Some(dir) = &self.working_dir {
            return dir.clone();
        }
        if let Ok(dir) = std::env::var("GRIDRUN_WORK")
            && !dir.is_empty()
        {
            return PathBuf::from(dir);
        }
        if let Some(base_dirs) = BaseDirs::new() {
            return base_dirs
                .home_dir()
                .join(".local")
                .join("share")
                .join("gridrun")
                .join("work");
        }
        PathBuf::from("work")
    }

    /// Resolve the sandbox base directory.
    pub fn sandbox_base(&self) -> PathBuf {
        match &self.sandbox_path {
            Some(path) => path.clone(),
            None => self.work_path().join("sandbox"),
        }
    }

    /// Build the configured parameter space: the cross product of all
    /// declared axes, repeated `repeat` times.
    pub fn parameter_source(&self) -> Result<ParameterSource> {
        let axes: Vec<ParameterSource> = self
            .parameter
            .iter()
            .map(|spec| {
                let values: Vec<&str> = spec.values.iter().map(String::as_str).collect();
                let leaf = if spec.untracked {
                    VarSource::untracked(&spec.name, &values)
                } else {
                    VarSource::new(&spec.name, &values)
                };
                ParameterSource::leaf(Box::new(leaf))
            })
            .collect();
        let crossed = ParameterSource::cross(axes)?;
        Ok(ParameterSource::repeat(crossed, self.repeat))
    }
}

/// Parse a time span given as `SS`, `MM:SS` or `HH:MM:SS` into seconds.
pub fn parse_time(value: &str) -> Result<u64> {
    let parts: Vec<&str> = value.split(':').collect();
    if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(GcError::Config(format!("malformed time span: {value:?}")));
    }
    let mut secs = 0u64;
    for part in &parts {
        let field: u64 = part
            .parse()
            .map_err(|_| GcError::Config(format!("malformed time span: {value:?}")))?;
        secs = secs * 60 + field;
    }
    Ok(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_time_accepts_all_three_forms() {
        assert_eq!(parse_time("90").unwrap(), 90);
        assert_eq!(parse_time("2:30").unwrap(), 150);
        assert_eq!(parse_time("1:00:00").unwrap(), 3600);
        assert!(parse_time("1:2:3:4").is_err());
        assert!(parse_time("abc").is_err());
        assert!(parse_time("1::2").is_err());
    }

    #[test]
    fn unknown_options_are_tolerated() {
        let config: Config = toml::from_str(
            r#"
            wall_time = "1:00:00"
            executable = "run.sh"
            future_option = "ignored"
            [[parameter]]
            name = "SEED"
            values = ["1", "2"]
            "#,
        )
        .unwrap();
        assert_eq!(config.wall_time.as_deref(), Some("1:00:00"));
        assert_eq!(config.parameter.len(), 1);
        assert_eq!(config.memory, -1);
        assert_eq!(config.wait_idle, 20);
    }

    #[test]
    fn parameter_source_crosses_axes() {
        let mut config = Config::default();
        config.parameter = vec![
            ParamSpec {
                name: "A".to_string(),
                values: vec!["x".to_string(), "y".to_string()],
                untracked: false,
            },
            ParamSpec {
                name: "B".to_string(),
                values: vec!["1".to_string(), "2".to_string(), "3".to_string()],
                untracked: false,
            },
        ];
        let source = config.parameter_source().unwrap();
        assert_eq!(source.parameter_len(), Some(6));

        config.repeat = 2;
        let source = config.parameter_source().unwrap();
        assert_eq!(source.parameter_len(), Some(12));
    }

    #[test]
    fn work_path_prefers_explicit_setting() {
        let mut config = Config::default();
        config.working_dir = Some(PathBuf::from("/tmp/gr-work"));
        assert_eq!(config.work_path(), PathBuf::from("/tmp/gr-work"));
        assert_eq!(config.sandbox_base(), PathBuf::from("/tmp/gr-work/sandbox"));
    }
}

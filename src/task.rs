//! The task module: packages the user command, the sandbox manifest and
//! per-job resource requirements, and owns the parameter adapter.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::info;
use ulid::Ulid;

use crate::config::{Config, parse_time};
use crate::error::{GcError, Result};
use crate::params::adapter::ParameterAdapter;
use crate::params::source::{ParameterSource, ResyncResult};
use crate::wms::Req;

/// Absolute/relative path pair of one sandbox input file.
#[derive(Debug, Clone)]
pub struct SandboxFile {
    pub path_abs: PathBuf,
    pub path_rel: String,
}

#[derive(Debug)]
pub struct Task {
    task_id: String,
    task_date: String,
    wall_time: u64,
    cpu_time: u64,
    cpus: u64,
    memory: i64,
    job_timeout: i64,
    sb_in: Vec<PathBuf>,
    sb_out: Vec<String>,
    gzip_output: bool,
    depends: Vec<String>,
    subst_files: Vec<String>,
    executable: String,
    arguments: Vec<String>,
    root_path: Option<PathBuf>,
    job_name_template: String,
    se_min_size: i64,
    scratch_space: (i64, i64),
    landing_zone_space: (i64, i64),
    adapter: ParameterAdapter,
    task_dict_memo: OnceLock<BTreeMap<String, String>>,
}

impl Task {
    /// Build a task from the configuration and a parameter space. The
    /// adapter mapping is restored from (or created under) the work dir.
    pub fn new(config: &Config, source: ParameterSource) -> Result<Task> {
        let wall_time = match &config.wall_time {
            Some(value) => parse_time(value)?,
            None => return Err(GcError::Config("option 'wall_time' is not set".into())),
        };
        let cpu_time = match &config.cpu_time {
            Some(value) => parse_time(value)?,
            None => wall_time,
        };
        let executable = config
            .executable
            .clone()
            .ok_or_else(|| GcError::Config("option 'executable' is not set".into()))?;

        let work_dir = config.work_path();
        std::fs::create_dir_all(&work_dir)
            .map_err(|e| GcError::job(format!("create work dir {}", work_dir.display()), e))?;
        let adapter = ParameterAdapter::new(source, &work_dir)?;

        let task_id = config.task_id.clone().unwrap_or_else(generate_task_id);
        let task_date = config
            .task_date
            .clone()
            .unwrap_or_else(|| format_date(now_secs()));
        info!(%task_id, %task_date, "task initialized");

        Ok(Task {
            task_id,
            task_date,
            wall_time,
            cpu_time,
            cpus: config.cpus.max(1),
            memory: config.memory,
            job_timeout: config.node_timeout,
            sb_in: config.input_files.clone(),
            sb_out: config.output_files.clone(),
            gzip_output: config.gzip_output,
            depends: config.depends.iter().map(|d| d.to_lowercase()).collect(),
            subst_files: config.subst_files.clone(),
            executable,
            arguments: config.arguments.clone(),
            root_path: config.root_path.clone(),
            job_name_template: config.job_name.clone(),
            se_min_size: config.se_min_size,
            scratch_space: (config.scratch_space_used, config.scratch_space_left),
            landing_zone_space: (config.landing_zone_space_used, config.landing_zone_space_left),
            adapter,
            task_dict_memo: OnceLock::new(),
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn task_date(&self) -> &str {
        &self.task_date
    }

    pub fn adapter(&self) -> &ParameterAdapter {
        &self.adapter
    }

    pub fn job_len(&self) -> Option<u64> {
        self.adapter.job_len()
    }

    /// Jobs whose parameter point vanished must not be handed to a backend.
    pub fn can_submit(&self, jobnum: u64) -> bool {
        self.adapter.job_content(jobnum).is_active()
    }

    pub fn dependencies(&self) -> &[String] {
        &self.depends
    }

    pub fn gzip_output(&self) -> bool {
        self.gzip_output
    }

    /// Task-level environment, memoized; only per-invocation transients
    /// are excluded here.
    pub fn task_dict(&self) -> &BTreeMap<String, String> {
        self.task_dict_memo.get_or_init(|| {
            let mut dict = BTreeMap::new();
            dict.insert("GC_TASK_ID".to_string(), self.task_id.clone());
            dict.insert("GC_TASK_DATE".to_string(), self.task_date.clone());
            dict.insert(
                "GC_VERSION".to_string(),
                env!("CARGO_PKG_VERSION").to_string(),
            );
            dict.insert("GC_RUNTIME".to_string(), self.get_command());
            dict.insert("GC_JOBTIMEOUT".to_string(), self.job_timeout.to_string());
            dict.insert(
                "GC_DEPFILES".to_string(),
                self.depends.join(" "),
            );
            dict.insert(
                "SB_INPUT_FILES".to_string(),
                self.sb_in_files()
                    .iter()
                    .map(|f| f.path_rel.clone())
                    .collect::<Vec<_>>()
                    .join(" "),
            );
            dict.insert("SB_OUTPUT_FILES".to_string(), self.sb_out.join(" "));
            dict.insert(
                "SUBST_FILES".to_string(),
                self.subst_files.join(" "),
            );
            dict.insert(
                "GZIP_OUT".to_string(),
                if self.gzip_output { "yes" } else { "no" }.to_string(),
            );
            dict.insert("SE_MINFILESIZE".to_string(), self.se_min_size.to_string());
            dict.insert("SCRATCH_UL".to_string(), self.scratch_space.0.to_string());
            dict.insert("SCRATCH_LL".to_string(), self.scratch_space.1.to_string());
            dict.insert(
                "LANDINGZONE_UL".to_string(),
                self.landing_zone_space.0.to_string(),
            );
            dict.insert(
                "LANDINGZONE_LL".to_string(),
                self.landing_zone_space.1.to_string(),
            );
            if let Some(root_path) = &self.root_path {
                dict.insert("GC_ROOTSYS".to_string(), root_path.display().to_string());
            }
            dict
        })
    }

    /// Parameter-derived environment of one job.
    pub fn job_dict(&self, jobnum: u64) -> BTreeMap<String, String> {
        let point = self.adapter.job_content(jobnum);
        let mut dict: BTreeMap<String, String> = self
            .adapter
            .job_metadata()
            .iter()
            .map(|meta| {
                let value = point.get(&meta.name).unwrap_or("").to_string();
                (meta.name.clone(), value)
            })
            .collect();
        dict.insert("GC_JOB_ID".to_string(), jobnum.to_string());
        dict
    }

    /// Values that change on every substitution: date, timestamp, GUID and
    /// a `RANDOM` seed. Deliberately not cached.
    pub fn transient_variables(&self) -> BTreeMap<String, String> {
        let now = now_secs();
        let mut dict = BTreeMap::new();
        dict.insert("GC_DATE".to_string(), format_date(now));
        dict.insert("GC_TIMESTAMP".to_string(), now.to_string());
        dict.insert("GC_GUID".to_string(), create_guid());
        dict.insert(
            "RANDOM".to_string(),
            (Ulid::new().random() % 900_000_000).to_string(),
        );
        dict
    }

    /// The full environment written into a job's config script.
    pub fn job_environment(&self, jobnum: u64) -> BTreeMap<String, String> {
        let mut env = self.task_dict().clone();
        env.extend(self.transient_variables());
        env.extend(self.job_dict(jobnum));
        env
    }

    /// Per-job requirement list: static limits plus the point's extras.
    pub fn requirements(&self, jobnum: u64) -> Vec<Req> {
        let mut reqs = vec![
            Req::WallTime(self.wall_time),
            Req::CpuTime(self.cpu_time),
            Req::Memory(self.memory),
            Req::Cpus(self.cpus),
        ];
        reqs.extend(self.adapter.job_content(jobnum).reqs().iter().cloned());
        reqs
    }

    pub fn sb_in_files(&self) -> Vec<SandboxFile> {
        self.sb_in
            .iter()
            .map(|path| SandboxFile {
                path_abs: path.clone(),
                path_rel: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            })
            .collect()
    }

    pub fn sb_out_files(&self) -> &[String] {
        &self.sb_out
    }

    /// The backend-independent shell command executed on the worker node.
    pub fn get_command(&self) -> String {
        let args = self.arguments.join(" ");
        match &self.root_path {
            Some(root_path) => {
                let builtin = root_path.join("bin").join(&self.executable).exists();
                let chmod = if builtin {
                    String::new()
                } else {
                    format!("chmod u+x {}; ", self.executable)
                };
                format!(
                    "{chmod}./gc-run.root.sh {} {args} > job.stdout 2> job.stderr",
                    self.executable
                )
            }
            None => format!(
                "chmod u+x {exe}; (./{exe} {args}) > job.stdout 2> job.stderr",
                exe = self.executable
            ),
        }
    }

    pub fn job_name(&self, jobnum: u64) -> Result<String> {
        self.substitute_variables("job name", &self.job_name_template, Some(jobnum), None)
    }

    /// Alias map used during substitution: historical short names plus the
    /// reflexive mapping of every known variable.
    pub fn var_alias_map(&self) -> BTreeMap<String, String> {
        let mut aliases: BTreeMap<String, String> = [
            ("DATE", "GC_DATE"),
            ("TIMESTAMP", "GC_TIMESTAMP"),
            ("GUID", "GC_GUID"),
            ("MY_JOBID", "GC_JOB_ID"),
            ("MY_JOB", "GC_JOB_ID"),
            ("JOBID", "GC_JOB_ID"),
            ("GC_JOBID", "GC_JOB_ID"),
            ("TASK_ID", "GC_TASK_ID"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for name in self.task_dict().keys() {
            aliases.insert(name.clone(), name.clone());
        }
        for meta in self.adapter.job_metadata() {
            aliases.insert(meta.name.clone(), meta.name.clone());
        }
        for name in ["GC_DATE", "GC_TIMESTAMP", "GC_GUID", "GC_JOB_ID", "RANDOM"] {
            aliases.insert(name.to_string(), name.to_string());
        }
        aliases
    }

    /// Two-pass `@NAME@` substitution over the merged variable map. Any
    /// marker left unresolved afterwards is a configuration error.
    pub fn substitute_variables(
        &self,
        name: &str,
        input: &str,
        jobnum: Option<u64>,
        additional: Option<&BTreeMap<String, String>>,
    ) -> Result<String> {
        let mut values: BTreeMap<String, String> = BTreeMap::new();
        if let Some(extra) = additional {
            values.extend(extra.clone());
        }
        values.extend(self.task_dict().clone());
        values.extend(self.transient_variables());
        if let Some(jobnum) = jobnum {
            values.extend(self.job_dict(jobnum));
        }
        let mut aliases = self.var_alias_map();
        if let Some(extra) = additional {
            for key in extra.keys() {
                aliases.insert(key.clone(), key.clone());
            }
        }
        let pass1 = replace_with_dict(input, &values, &aliases);
        let result = replace_with_dict(&pass1, &values, &aliases);
        if let Some(unresolved) = find_unresolved(&result) {
            return Err(GcError::Config(format!(
                "{name} references unknown variable @{unresolved}@: {result}"
            )));
        }
        Ok(result)
    }

    /// Dry-run every task variable through substitution so broken
    /// references surface before the first submission.
    pub fn validate_variables(&self) -> Result<()> {
        let mut example: BTreeMap<String, String> = BTreeMap::new();
        for name in ["X", "XBASE", "XEXT"] {
            example.insert(name.to_string(), String::new());
        }
        for meta in self.adapter.job_metadata() {
            example.insert(meta.name, String::new());
        }
        let entries: Vec<(String, String)> = self
            .task_dict()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (name, value) in entries {
            self.substitute_variables(&name, &value, None, Some(&example))?;
        }
        Ok(())
    }

    /// Mid-flight reconfiguration: delegate to the adapter's resync and
    /// report affected job numbers.
    pub fn get_intervention(&self) -> Result<ResyncResult> {
        self.adapter.resync()
    }
}

fn replace_with_dict(
    input: &str,
    values: &BTreeMap<String, String>,
    aliases: &BTreeMap<String, String>,
) -> String {
    let mut result = input.to_string();
    for (alias, target) in aliases {
        if let Some(value) = values.get(target) {
            let marker = format!("@{alias}@");
            if result.contains(&marker) {
                result = result.replace(&marker, value);
            }
        }
    }
    result
}

/// First `@NAME@` marker still present in `input`, if any.
fn find_unresolved(input: &str) -> Option<&str> {
    let mut pos = 0;
    while let Some(start) = input[pos..].find('@').map(|i| i + pos) {
        let rest = &input[start + 1..];
        let end = rest.find('@')?;
        let candidate = &rest[..end];
        if !candidate.is_empty()
            && candidate
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            return Some(candidate);
        }
        pos = start + 1;
    }
    None
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn generate_task_id() -> String {
    let nonce = format!("{}{}", now_secs(), Ulid::new());
    let digest = format!("{:x}", md5::compute(nonce.as_bytes()));
    format!("GC{}", &digest[..12])
}

fn create_guid() -> String {
    let bits: u128 = Ulid::new().into();
    let hex = format!("{bits:032x}");
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Format an epoch timestamp as `YYYY-MM-DD` (UTC).
fn format_date(secs: u64) -> String {
    let days_total = secs / 86_400;
    let mut days = days_total;
    let mut year = 1970u64;
    loop {
        let days_in_year = if is_leap(year) { 366 } else { 365 };
        if days < days_in_year {
            break;
        }
        days -= days_in_year;
        year += 1;
    }
    let leap = is_leap(year);
    let month_days: [u64; 12] = [
        31,
        if leap { 29 } else { 28 },
        31,
        30,
        31,
        30,
        31,
        31,
        30,
        31,
        30,
        31,
    ];
    let mut month = 0usize;
    for (idx, &len) in month_days.iter().enumerate() {
        if days < len {
            month = idx;
            break;
        }
        days -= len;
    }
    format!("{:04}-{:02}-{:02}", year, month + 1, days + 1)
}

fn is_leap(year: u64) -> bool {
    (year.is_multiple_of(4) && !year.is_multiple_of(100)) || year.is_multiple_of(400)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.working_dir = Some(dir.join("work"));
        config.wall_time = Some("1:00:00".to_string());
        config.executable = Some("analyze.sh".to_string());
        config.task_id = Some("GCtest12345".to_string());
        config
    }

    fn test_task(dir: &std::path::Path) -> Task {
        let source = ParameterSource::var("SEED", &["11", "22", "33"]);
        Task::new(&test_config(dir), source).unwrap()
    }

    #[test]
    fn date_formatting_matches_known_values() {
        assert_eq!(format_date(0), "1970-01-01");
        assert_eq!(format_date(1704067200), "2024-01-01");
        // Leap day.
        assert_eq!(format_date(1709164800), "2024-02-29");
    }

    #[test]
    fn missing_wall_time_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.wall_time = None;
        let err = Task::new(&config, ParameterSource::var("A", &["x"])).unwrap_err();
        assert!(matches!(err, GcError::Config(_)), "got {err:?}");
    }

    #[test]
    fn task_dict_contains_identity_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let task = test_task(dir.path());
        let dict = task.task_dict();
        assert_eq!(dict.get("GC_TASK_ID").map(String::as_str), Some("GCtest12345"));
        assert!(dict.contains_key("GC_TASK_DATE"));
        assert!(dict.contains_key("GC_VERSION"));
        assert!(dict.contains_key("SB_INPUT_FILES"));
        assert!(dict.contains_key("SB_OUTPUT_FILES"));
        assert!(dict.get("GC_RUNTIME").unwrap().contains("analyze.sh"));
    }

    #[test]
    fn job_dict_reflects_the_parameter_point() {
        let dir = tempfile::tempdir().unwrap();
        let task = test_task(dir.path());
        let dict = task.job_dict(1);
        assert_eq!(dict.get("SEED").map(String::as_str), Some("22"));
        assert_eq!(dict.get("GC_JOB_ID").map(String::as_str), Some("1"));
    }

    #[test]
    fn substitution_resolves_aliases_in_two_passes() {
        let dir = tempfile::tempdir().unwrap();
        let task = test_task(dir.path());
        let mut extra = BTreeMap::new();
        // The first pass expands INDIRECT, the second resolves the marker
        // it produced.
        extra.insert("INDIRECT".to_string(), "@TASK_ID@".to_string());
        let result = task
            .substitute_variables("test", "id=@INDIRECT@ job=@MY_JOB@", Some(2), Some(&extra))
            .unwrap();
        assert_eq!(result, "id=GCtest12345 job=2");
    }

    #[test]
    fn unresolved_variable_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let task = test_task(dir.path());
        let err = task
            .substitute_variables("test", "@NO_SUCH_VARIABLE@", None, None)
            .unwrap_err();
        assert!(matches!(err, GcError::Config(_)), "got {err:?}");
    }

    #[test]
    fn transients_differ_between_invocations() {
        let dir = tempfile::tempdir().unwrap();
        let task = test_task(dir.path());
        let first = task.transient_variables();
        let second = task.transient_variables();
        assert_ne!(first.get("GC_GUID"), second.get("GC_GUID"));
        assert!(first.contains_key("GC_DATE"));
        assert!(first.contains_key("GC_TIMESTAMP"));
        assert!(first.contains_key("RANDOM"));
    }

    #[test]
    fn default_job_name_is_task_and_job_id() {
        let dir = tempfile::tempdir().unwrap();
        let task = test_task(dir.path());
        assert_eq!(task.job_name(3).unwrap(), "GCtest12345.3");
    }

    #[test]
    fn requirements_cover_static_limits() {
        let dir = tempfile::tempdir().unwrap();
        let task = test_task(dir.path());
        let reqs = task.requirements(0);
        assert!(reqs.contains(&Req::WallTime(3600)));
        assert!(reqs.contains(&Req::CpuTime(3600)));
        assert!(reqs.contains(&Req::Cpus(1)));
        assert!(reqs.contains(&Req::Memory(-1)));
    }

    #[test]
    fn validate_variables_accepts_the_default_setup() {
        let dir = tempfile::tempdir().unwrap();
        let task = test_task(dir.path());
        task.validate_variables().unwrap();
    }

    #[test]
    fn guid_has_canonical_shape() {
        let guid = create_guid();
        let parts: Vec<&str> = guid.split('-').collect();
        assert_eq!(
            parts.iter().map(|p| p.len()).collect::<Vec<_>>(),
            vec![8, 4, 4, 4, 12]
        );
    }

    #[test]
    fn intervention_delegates_to_the_adapter() {
        let dir = tempfile::tempdir().unwrap();
        let task = test_task(dir.path());
        let result = task.get_intervention().unwrap();
        assert!(result.is_unchanged());
    }
}

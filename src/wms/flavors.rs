//! Concrete local batch-system flavors.
//!
//! A flavor contributes only the backend-specific pieces of the submit
//! pipeline: the executable names, the argument builders and the parser
//! that extracts the backend job id from submit output. Everything else
//! lives in [`crate::wms::local::LocalWms`].

use std::path::Path;

use crate::wms::Req;

pub trait LocalFlavor: Send + Sync {
    /// Backend alias used inside `gc_id`s.
    fn name(&self) -> &'static str;
    fn submit_exec(&self) -> &str;
    fn cancel_exec(&self) -> &str;
    /// Backend-specific arguments placed between the configured submit
    /// options and the launcher script.
    fn submit_arguments(
        &self,
        jobnum: u64,
        job_name: &str,
        reqs: &[Req],
        sandbox: &Path,
        stdout: &Path,
        stderr: &Path,
    ) -> Vec<String>;
    /// Arguments passed to the launcher script itself.
    fn job_arguments(&self, jobnum: u64, sandbox: &Path) -> Vec<String> {
        vec![jobnum.to_string(), sandbox.display().to_string()]
    }
    /// Extract the raw backend id from the submit executable's stdout.
    fn parse_submit_output(&self, output: &str) -> Option<String>;
}

fn req_walltime(reqs: &[Req]) -> Option<u64> {
    reqs.iter().find_map(|r| match r {
        Req::WallTime(secs) => Some(*secs),
        _ => None,
    })
}

fn req_memory(reqs: &[Req]) -> Option<i64> {
    reqs.iter().find_map(|r| match r {
        Req::Memory(mb) if *mb > 0 => Some(*mb),
        _ => None,
    })
}

fn req_cpus(reqs: &[Req]) -> Option<u64> {
    reqs.iter().find_map(|r| match r {
        Req::Cpus(n) if *n > 1 => Some(*n),
        _ => None,
    })
}

fn req_queues(reqs: &[Req]) -> Option<&[String]> {
    reqs.iter().find_map(|r| match r {
        Req::Queues(list) if !list.is_empty() => Some(list.as_slice()),
        _ => None,
    })
}

fn hms(secs: u64) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

pub struct SlurmFlavor;

impl LocalFlavor for SlurmFlavor {
    fn name(&self) -> &'static str {
        "SLURM"
    }
    fn submit_exec(&self) -> &str {
        "sbatch"
    }
    fn cancel_exec(&self) -> &str {
        "scancel"
    }

    fn submit_arguments(
        &self,
        _jobnum: u64,
        job_name: &str,
        reqs: &[Req],
        _sandbox: &Path,
        stdout: &Path,
        stderr: &Path,
    ) -> Vec<String> {
        let mut args = vec![
            "-J".into(),
            job_name.to_string(),
            "-o".into(),
            stdout.display().to_string(),
            "-e".into(),
            stderr.display().to_string(),
        ];
        if let Some(secs) = req_walltime(reqs) {
            args.extend(["-t".into(), (secs.div_ceil(60)).to_string()]);
        }
        if let Some(mb) = req_memory(reqs) {
            args.extend(["--mem".into(), format!("{mb}M")]);
        }
        if let Some(cpus) = req_cpus(reqs) {
            args.extend(["-c".into(), cpus.to_string()]);
        }
        if let Some(queues) = req_queues(reqs) {
            args.extend(["-p".into(), queues.join(",")]);
        }
        args
    }

    // "Submitted batch job 123"
    fn parse_submit_output(&self, output: &str) -> Option<String> {
        let raw = output.split_whitespace().last()?;
        raw.chars()
            .all(|c| c.is_ascii_digit())
            .then(|| raw.to_string())
    }
}

pub struct PbsFlavor;

impl LocalFlavor for PbsFlavor {
    fn name(&self) -> &'static str {
        "PBS"
    }
    fn submit_exec(&self) -> &str {
        "qsub"
    }
    fn cancel_exec(&self) -> &str {
        "qdel"
    }

    fn submit_arguments(
        &self,
        _jobnum: u64,
        job_name: &str,
        reqs: &[Req],
        _sandbox: &Path,
        stdout: &Path,
        stderr: &Path,
    ) -> Vec<String> {
        let mut args = vec![
            "-N".into(),
            job_name.to_string(),
            "-o".into(),
            stdout.display().to_string(),
            "-e".into(),
            stderr.display().to_string(),
        ];
        if let Some(secs) = req_walltime(reqs) {
            args.extend(["-l".into(), format!("walltime={}", hms(secs))]);
        }
        if let Some(mb) = req_memory(reqs) {
            args.extend(["-l".into(), format!("pvmem={mb}mb")]);
        }
        if let Some(queues) = req_queues(reqs) {
            args.extend(["-q".into(), queues.join(",")]);
        }
        args
    }

    // "123.headnode.example.org"
    fn parse_submit_output(&self, output: &str) -> Option<String> {
        let raw = output.lines().next()?.trim();
        (!raw.is_empty()).then(|| raw.to_string())
    }
}

pub struct OgeFlavor;

impl LocalFlavor for OgeFlavor {
    fn name(&self) -> &'static str {
        "OGE"
    }
    fn submit_exec(&self) -> &str {
        "qsub"
    }
    fn cancel_exec(&self) -> &str {
        "qdel"
    }

    fn submit_arguments(
        &self,
        _jobnum: u64,
        job_name: &str,
        reqs: &[Req],
        _sandbox: &Path,
        stdout: &Path,
        stderr: &Path,
    ) -> Vec<String> {
        let mut args = vec![
            "-N".into(),
            job_name.to_string(),
            "-o".into(),
            stdout.display().to_string(),
            "-e".into(),
            stderr.display().to_string(),
        ];
        if let Some(secs) = req_walltime(reqs) {
            args.extend(["-l".into(), format!("h_rt={}", hms(secs))]);
        }
        if let Some(mb) = req_memory(reqs) {
            args.extend(["-l".into(), format!("h_vmem={mb}M")]);
        }
        if let Some(queues) = req_queues(reqs) {
            args.extend(["-q".into(), queues.join(",")]);
        }
        args
    }

    // "Your job 123 ("name") has been submitted"
    fn parse_submit_output(&self, output: &str) -> Option<String> {
        let raw = output.split_whitespace().nth(2)?;
        raw.chars()
            .all(|c| c.is_ascii_digit())
            .then(|| raw.to_string())
    }
}

pub struct LsfFlavor;

impl LocalFlavor for LsfFlavor {
    fn name(&self) -> &'static str {
        "LSF"
    }
    fn submit_exec(&self) -> &str {
        "bsub"
    }
    fn cancel_exec(&self) -> &str {
        "bkill"
    }

    fn submit_arguments(
        &self,
        _jobnum: u64,
        job_name: &str,
        reqs: &[Req],
        _sandbox: &Path,
        stdout: &Path,
        stderr: &Path,
    ) -> Vec<String> {
        let mut args = vec![
            "-J".into(),
            job_name.to_string(),
            "-o".into(),
            stdout.display().to_string(),
            "-e".into(),
            stderr.display().to_string(),
        ];
        if let Some(secs) = req_walltime(reqs) {
            args.extend(["-W".into(), (secs.div_ceil(60)).to_string()]);
        }
        if let Some(queues) = req_queues(reqs) {
            args.extend(["-q".into(), queues.join(",")]);
        }
        args
    }

    // "Job <123> is submitted to queue <short>."
    fn parse_submit_output(&self, output: &str) -> Option<String> {
        let start = output.find('<')? + 1;
        let end = output[start..].find('>')? + start;
        let raw = &output[start..end];
        (!raw.is_empty()).then(|| raw.to_string())
    }
}

pub struct JmsFlavor;

impl LocalFlavor for JmsFlavor {
    fn name(&self) -> &'static str {
        "JMS"
    }
    fn submit_exec(&self) -> &str {
        "job_submit"
    }
    fn cancel_exec(&self) -> &str {
        "job_cancel"
    }

    fn submit_arguments(
        &self,
        _jobnum: u64,
        job_name: &str,
        reqs: &[Req],
        _sandbox: &Path,
        stdout: &Path,
        stderr: &Path,
    ) -> Vec<String> {
        let mut args = vec![
            "-J".into(),
            job_name.to_string(),
            "-o".into(),
            stdout.display().to_string(),
            "-e".into(),
            stderr.display().to_string(),
        ];
        if let Some(secs) = req_walltime(reqs) {
            args.extend(["-t".into(), secs.to_string()]);
        }
        args
    }

    fn parse_submit_output(&self, output: &str) -> Option<String> {
        output
            .split_whitespace()
            .find(|tok| !tok.is_empty() && tok.chars().all(|c| c.is_ascii_digit()))
            .map(|tok| tok.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slurm_parses_batch_job_line() {
        assert_eq!(
            SlurmFlavor.parse_submit_output("Submitted batch job 4242\n"),
            Some("4242".to_string())
        );
        assert_eq!(SlurmFlavor.parse_submit_output("sbatch: error"), None);
        assert_eq!(SlurmFlavor.parse_submit_output(""), None);
    }

    #[test]
    fn lsf_parses_bracketed_id() {
        assert_eq!(
            LsfFlavor.parse_submit_output("Job <77> is submitted to queue <short>.\n"),
            Some("77".to_string())
        );
        assert_eq!(LsfFlavor.parse_submit_output("no brackets here"), None);
    }

    #[test]
    fn oge_parses_your_job_line() {
        assert_eq!(
            OgeFlavor.parse_submit_output("Your job 31337 (\"t.0001\") has been submitted\n"),
            Some("31337".to_string())
        );
    }

    #[test]
    fn pbs_takes_the_first_line() {
        assert_eq!(
            PbsFlavor.parse_submit_output("99.head.example.org\n"),
            Some("99.head.example.org".to_string())
        );
        assert_eq!(PbsFlavor.parse_submit_output("\n"), None);
    }

    #[test]
    fn slurm_arguments_cover_requirements() {
        let reqs = vec![
            Req::WallTime(3600),
            Req::Memory(2048),
            Req::Cpus(4),
            Req::Queues(vec!["short".to_string()]),
        ];
        let args = SlurmFlavor.submit_arguments(
            0,
            "t.0000",
            &reqs,
            Path::new("/sbx"),
            Path::new("/sbx/gc.stdout"),
            Path::new("/sbx/gc.stderr"),
        );
        let joined = args.join(" ");
        assert!(joined.contains("-J t.0000"));
        assert!(joined.contains("-t 60"));
        assert!(joined.contains("--mem 2048M"));
        assert!(joined.contains("-c 4"));
        assert!(joined.contains("-p short"));
    }
}

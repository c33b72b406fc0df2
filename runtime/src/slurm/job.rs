//! Slurm job model: script synthesis and scheduler output parsing.
//!
//! Everything here is pure so each scheduler output format can be pinned
//! down by unit tests.

use std::collections::BTreeMap;

use chrono::{NaiveDateTime, TimeZone, Utc};
use multicri_core::error::{CriError, Result};

use crate::transport::double_quote;

pub const STDOUT_FILE: &str = "stdout.out";
pub const STDERR_FILE: &str = "sterr.out";
pub const RUN_SCRIPT: &str = "run.sh";
pub const PRERUN_SCRIPT: &str = "prerun.sh";
pub const BATCH_SCRIPT: &str = "batch.sh";
pub const IMAGE_SCRIPT: &str = "image.sh";

const SUBMITTED_MARKER: &str = "Submitted batch job ";
const DATE_LAYOUT: &str = "%Y-%m-%dT%H:%M:%S";
const UNKNOWN_DATE: &str = "Unknown";

/// One `#SBATCH` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub flag: String,
    pub value: String,
}

impl Directive {
    pub fn new(flag: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            flag: flag.into(),
            value: value.into(),
        }
    }

    fn render(&self) -> String {
        if self.value.is_empty() {
            format!("#SBATCH {}", self.flag)
        } else {
            format!("#SBATCH {} {}", self.flag, self.value)
        }
    }
}

/// Everything needed to submit one job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobConfig {
    /// Scheduler directives, in order.
    pub directives: Vec<Directive>,
    /// Free-form directive block copied verbatim.
    pub custom: String,
    /// Command line the job runs.
    pub command: String,
    /// Job directory on the cluster.
    pub path: String,
    /// Launcher script path on the cluster.
    pub script: String,
    /// Pre-run script content (empty for none).
    pub prerun: String,
    /// Variables exported before submission.
    pub environment: BTreeMap<String, String>,
}

impl JobConfig {
    pub fn batch_script_path(&self) -> String {
        format!("{}/{}", self.path, BATCH_SCRIPT)
    }

    pub fn prerun_script_path(&self) -> String {
        format!("{}/{}", self.path, PRERUN_SCRIPT)
    }

    /// Directive script: shebang, `#SBATCH` lines, custom block, command.
    pub fn batch_script(&self) -> Result<String> {
        if self.directives.is_empty() && self.custom.trim().is_empty() {
            return Err(CriError::Config(
                "no configuration provided for the batch job".to_string(),
            ));
        }

        let mut script = String::from("#!/bin/bash\n");
        for directive in &self.directives {
            script.push_str(&directive.render());
            script.push('\n');
        }
        if !self.custom.trim().is_empty() {
            script.push_str(self.custom.trim_end());
            script.push('\n');
        }
        script.push_str(&self.command);
        script.push('\n');
        Ok(script)
    }

    /// Launcher script: exports, `cd` into the job directory, optional
    /// pre-run, then submission of the directive script.
    pub fn launcher_script(&self) -> String {
        let mut script = String::from("#!/bin/bash\n");
        for (key, value) in &self.environment {
            script.push_str(&format!("export {}={}\n", key, double_quote(value)));
        }
        script.push_str(&format!("cd {}\n", self.path));
        if self.prerun_script().is_some() {
            script.push_str(&format!("source {}\n", PRERUN_SCRIPT));
        }
        script.push_str(&format!("sbatch {}\n", BATCH_SCRIPT));
        script
    }

    pub fn prerun_script(&self) -> Option<String> {
        if self.prerun.trim().is_empty() {
            None
        } else {
            Some(format!("{}\n", self.prerun.trim_end()))
        }
    }
}

/// Scheduler job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobReference(pub u64);

/// Normalized scheduler view of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobStatus {
    pub job_state: String,
    pub exit_code: i32,
    pub reason: String,
    /// Epoch seconds, 0 when unknown.
    pub start_time: i64,
    /// Epoch seconds, 0 when unknown.
    pub end_time: i64,
}

/// Container-level meaning of a job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Running,
    Exited { exit_code: i32, reason: &'static str },
    /// Queued or in an unrecognized state; the container stays CREATED.
    Pending,
}

pub const REASON_COMPLETED: &str = "completed";
pub const REASON_OOM_KILLED: &str = "OOMKilled";
pub use multicri_core::metadata::REASON_CANNOT_RUN;

impl JobStatus {
    pub fn outcome(&self) -> JobOutcome {
        match self.job_state.as_str() {
            "RUNNING" => JobOutcome::Running,
            "COMPLETED" | "COMPLETING" => JobOutcome::Exited {
                exit_code: self.exit_code,
                reason: REASON_COMPLETED,
            },
            "CANCELLED" | "TIMEOUT" => JobOutcome::Exited {
                exit_code: 1,
                reason: REASON_OOM_KILLED,
            },
            "FAILED" | "NODE_FAIL" => JobOutcome::Exited {
                exit_code: if self.exit_code == 0 { 1 } else { self.exit_code },
                reason: REASON_CANNOT_RUN,
            },
            _ => JobOutcome::Pending,
        }
    }
}

/// Extract the job ID from `sbatch` output.
pub fn parse_submission(output: &str) -> Result<JobReference> {
    let start = output.find(SUBMITTED_MARKER).ok_or_else(|| {
        CriError::Parse(format!("job submission not confirmed: {}", output.trim()))
    })?;
    let token = output[start + SUBMITTED_MARKER.len()..]
        .split_whitespace()
        .next()
        .unwrap_or("");
    token
        .parse()
        .map(JobReference)
        .map_err(|_| CriError::Parse(format!("invalid job id: {:?}", token)))
}

/// Parse `scontrol show jobid -dd` output (`key=value` pairs separated by
/// whitespace).
pub fn parse_control_status(output: &str) -> Result<JobStatus> {
    let fields: BTreeMap<&str, &str> = output
        .split_whitespace()
        .filter_map(|item| item.split_once('='))
        .collect();

    let job_state = fields
        .get("JobState")
        .ok_or_else(|| CriError::Parse(format!("no JobState in: {}", output.trim())))?;

    Ok(JobStatus {
        job_state: job_state.to_string(),
        exit_code: fields
            .get("ExitCode")
            .map(|v| parse_exit_code(v))
            .unwrap_or(0),
        reason: fields.get("Reason").unwrap_or(&"").to_string(),
        start_time: fields.get("StartTime").map(|v| parse_date(v)).unwrap_or(0),
        end_time: fields.get("EndTime").map(|v| parse_date(v)).unwrap_or(0),
    })
}

/// Parse one `sacct -p -n -o start,end,exitcode,state,comment` line.
pub fn parse_accounting_status(output: &str) -> Result<JobStatus> {
    let line = output
        .lines()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| CriError::Parse("no accounting record for job".to_string()))?;
    let fields: Vec<&str> = line.trim().split('|').collect();
    if fields.len() < 4 {
        return Err(CriError::Parse(format!("malformed accounting line: {}", line)));
    }

    // "CANCELLED by 1000" carries the cancelling uid after the state.
    let job_state = fields[3].split_whitespace().next().unwrap_or("").to_string();
    let comment = fields.get(4).map(|c| c.trim()).unwrap_or("");
    let reason = if comment.is_empty() {
        job_state.clone()
    } else {
        comment.to_string()
    };

    Ok(JobStatus {
        exit_code: parse_exit_code(fields[2]),
        reason,
        start_time: parse_date(fields[0]),
        end_time: parse_date(fields[1]),
        job_state,
    })
}

/// `exitcode:signal` → exit code; anything unparseable is 0.
fn parse_exit_code(value: &str) -> i32 {
    value
        .split(':')
        .next()
        .and_then(|code| code.trim().parse().ok())
        .unwrap_or(0)
}

/// Scheduler timestamp → epoch seconds; `Unknown` or unparseable → 0.
pub fn parse_date(value: &str) -> i64 {
    let value = value.trim();
    if value.is_empty() || value == UNKNOWN_DATE {
        return 0;
    }
    NaiveDateTime::parse_from_str(value, DATE_LAYOUT)
        .map(|dt| Utc.from_utc_datetime(&dt).timestamp())
        .unwrap_or(0)
}

/// Escape parentheses so a token survives the batch script's shell.
pub fn escape_special_characters(token: &str) -> String {
    token.replace('(', "\\(").replace(')', "\\)")
}

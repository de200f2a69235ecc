//! Adapters for the batch systems jobs are submitted to.

use std::sync::LazyLock;

use regex::Regex;

use crate::config::BatchSchedulerKind;
use crate::error::{AkrunError, Result};
use crate::remote::shell_quote;

/// File in the job directory holding the raw submission answer.
pub const JOB_ID_FILE: &str = "job.id";
pub const JOB_SCRIPT_FILE: &str = "job.sh";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Finished,
}

pub trait BatchScheduler: Send + Sync {
    /// Shell line submitting `job.sh` from `dir` and printing the job id file.
    fn submit_command(&self, dir: &str) -> String;
    fn parse_job_id(&self, output: &str) -> Option<String>;
    fn status_command(&self, job_id: &str) -> String;
    fn parse_status(&self, output: &str) -> Result<JobState>;
}

pub fn scheduler_for(kind: BatchSchedulerKind) -> &'static dyn BatchScheduler {
    match kind {
        BatchSchedulerKind::Slurm => &Slurm,
        BatchSchedulerKind::Pbs => &Pbs,
        BatchSchedulerKind::Shell => &Background,
    }
}

fn job_id_path(dir: &str) -> String {
    shell_quote(&format!("{dir}/{JOB_ID_FILE}"))
}

static SLURM_JOB_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Submitted batch job (\d+)").expect("static slurm pattern"));
static PBS_JOB_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(\d+(?:\.[\w.\-]+)?)\s*$").expect("static pbs pattern"));
static PBS_JOB_STATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"job_state\s*=\s*(\w)").expect("static pbs state pattern"));
static PID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(\d+)\s*$").expect("static pid pattern"));

pub struct Slurm;

impl BatchScheduler for Slurm {
    fn submit_command(&self, dir: &str) -> String {
        format!(
            "cd {} && sbatch {JOB_SCRIPT_FILE} > {JOB_ID_FILE} 2>&1; cat {}",
            shell_quote(dir),
            job_id_path(dir)
        )
    }

    fn parse_job_id(&self, output: &str) -> Option<String> {
        SLURM_JOB_ID.captures(output).map(|c| c[1].to_string())
    }

    fn status_command(&self, job_id: &str) -> String {
        format!("squeue -h -j {job_id} -o %T 2>&1")
    }

    fn parse_status(&self, output: &str) -> Result<JobState> {
        let state = output.trim();
        if state.is_empty() || state.contains("Invalid job id") {
            return Ok(JobState::Finished);
        }
        match state.lines().next().unwrap_or_default().trim() {
            "PENDING" | "CONFIGURING" | "REQUEUED" | "SUSPENDED" => Ok(JobState::Queued),
            "RUNNING" | "COMPLETING" => Ok(JobState::Running),
            "COMPLETED" | "FAILED" | "CANCELLED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" => {
                Ok(JobState::Finished)
            }
            other => Err(AkrunError::Unparsable(format!("squeue reported '{other}'"))),
        }
    }
}

pub struct Pbs;

impl BatchScheduler for Pbs {
    fn submit_command(&self, dir: &str) -> String {
        format!(
            "cd {} && qsub {JOB_SCRIPT_FILE} > {JOB_ID_FILE} 2>&1; cat {}",
            shell_quote(dir),
            job_id_path(dir)
        )
    }

    fn parse_job_id(&self, output: &str) -> Option<String> {
        PBS_JOB_ID.captures(output).map(|c| c[1].to_string())
    }

    fn status_command(&self, job_id: &str) -> String {
        format!("qstat -f {job_id} 2>&1")
    }

    fn parse_status(&self, output: &str) -> Result<JobState> {
        if output.contains("Unknown Job Id") || output.contains("Job has finished") {
            return Ok(JobState::Finished);
        }
        let caps = PBS_JOB_STATE
            .captures(output)
            .ok_or_else(|| AkrunError::Unparsable(format!("qstat output: {}", output.trim())))?;
        match &caps[1] {
            "Q" | "H" | "W" | "T" => Ok(JobState::Queued),
            "R" | "E" => Ok(JobState::Running),
            "C" | "F" => Ok(JobState::Finished),
            other => Err(AkrunError::Unparsable(format!("qstat job_state '{other}'"))),
        }
    }
}

/// Jobs run as background processes on the access node itself.
pub struct Background;

impl BatchScheduler for Background {
    fn submit_command(&self, dir: &str) -> String {
        format!(
            "cd {} && {{ nohup bash {JOB_SCRIPT_FILE} > /dev/null 2>&1 & echo $! > {JOB_ID_FILE}; }}; cat {}",
            shell_quote(dir),
            job_id_path(dir)
        )
    }

    fn parse_job_id(&self, output: &str) -> Option<String> {
        PID.captures(output).map(|c| c[1].to_string())
    }

    fn status_command(&self, job_id: &str) -> String {
        format!("kill -0 {job_id} 2>/dev/null && echo RUNNING || echo FINISHED")
    }

    fn parse_status(&self, output: &str) -> Result<JobState> {
        if output.contains("FINISHED") {
            Ok(JobState::Finished)
        } else if output.contains("RUNNING") {
            Ok(JobState::Running)
        } else {
            Err(AkrunError::Unparsable(format!("process probe: {}", output.trim())))
        }
    }
}

//! On-disk layout of task directories.

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;

/// Format of the per-run identifier that names a task directory.
pub const TIME_STAMP_FORMAT: &str = "%Y.%m.%d.%H.%M.%S.%6f";

pub fn time_stamp(at: NaiveDateTime) -> String {
    at.format(TIME_STAMP_FORMAT).to_string()
}

/// Roots of the active and completed task trees.
#[derive(Debug, Clone)]
pub struct TaskLayout {
    pub data_root: PathBuf,
    pub completed_root: PathBuf,
}

impl TaskLayout {
    pub fn new(data_root: impl Into<PathBuf>, completed_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            completed_root: completed_root.into(),
        }
    }

    /// `<data_root>/<resource>/<app>/<time_stamp>`
    pub fn active_task_dir(&self, resource: &str, app: &str, time_stamp: &str) -> PathBuf {
        self.data_root.join(resource).join(app).join(time_stamp)
    }

    /// Archive location, split by year and month when the time stamp allows it.
    pub fn completed_task_dir(&self, resource: &str, app: &str, time_stamp: &str) -> PathBuf {
        let base = self.completed_root.join(resource).join(app);
        let parts: Vec<&str> = time_stamp.split('.').collect();
        if parts.len() >= 4 {
            base.join(parts[0]).join(parts[1]).join(time_stamp)
        } else {
            base.join(time_stamp)
        }
    }
}

pub fn task_proc_dir(task_dir: &Path) -> PathBuf {
    task_dir.join("proc")
}

pub fn task_log_path(task_dir: &Path) -> PathBuf {
    task_proc_dir(task_dir).join("log")
}

/// Local copies of the remote job's output.
pub fn job_files_dir(task_dir: &Path) -> PathBuf {
    task_dir.join("jobfiles")
}

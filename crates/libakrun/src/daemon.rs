//! The scheduling daemon: promotes due tasks, steps active ones, archives
//! finished ones and answers control-plane requests between ticks.

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use akrun_protocol::{
    ControlRequest, ControlResponse, SchedulerFlags, TaskId, TaskLocation, TaskStatus, functions,
};
use chrono::{Local, NaiveDateTime, TimeDelta};
use serde_json::{Map, Value, json};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::{ConfigLookup, RetryPolicy, SessionTimeouts};
use crate::control::{ControlEnvelope, argument};
use crate::error::{AkrunError, Result};
use crate::logging::LogRedirect;
use crate::recurrence::{
    StartWindow, next_occurrence, next_start, normalize_period, now_local, parse_time_to_start,
};
use crate::remote::Connector;
use crate::store::{ActiveTask, DAEMON_LOCK, NewTask, Progress, ScheduledTask, TaskStore};
use crate::task::layout::task_proc_dir;
use crate::task::{ParserRegistry, StepContext, TaskHandler, TaskLayout, snapshot, time_stamp};

#[derive(Debug, Clone)]
pub struct DaemonSettings {
    pub loop_period: Duration,
    /// Longest a writer waits for another writer's advisory lock.
    pub lock_max_wait: Duration,
    pub job_poll_interval: Duration,
    pub default_window: StartWindow,
    pub retry: RetryPolicy,
    pub timeouts: SessionTimeouts,
}

impl DaemonSettings {
    /// Interval between advisory-lock polls.
    pub fn lock_poll_interval(&self) -> Duration {
        self.loop_period.mul_f64(0.45)
    }
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            loop_period: Duration::from_secs(5),
            lock_max_wait: Duration::from_secs(600),
            job_poll_interval: Duration::from_secs(60),
            default_window: StartWindow {
                start: chrono::NaiveTime::MIN,
                end: chrono::NaiveTime::from_hms_opt(23, 59, 0).unwrap_or(chrono::NaiveTime::MIN),
            },
            retry: RetryPolicy::default(),
            timeouts: SessionTimeouts::default(),
        }
    }
}

/// Runtime-switchable halves of the daemon loop.
#[derive(Clone)]
pub struct AdminFlags {
    new_tasks: Arc<AtomicBool>,
    active_tasks_check: Arc<AtomicBool>,
}

impl Default for AdminFlags {
    fn default() -> Self {
        Self {
            new_tasks: Arc::new(AtomicBool::new(true)),
            active_tasks_check: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl AdminFlags {
    pub fn new_tasks(&self) -> bool {
        self.new_tasks.load(Ordering::SeqCst)
    }

    pub fn set_new_tasks(&self, on: bool) {
        self.new_tasks.store(on, Ordering::SeqCst);
    }

    pub fn active_tasks_check(&self) -> bool {
        self.active_tasks_check.load(Ordering::SeqCst)
    }

    pub fn set_active_tasks_check(&self, on: bool) {
        self.active_tasks_check.store(on, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> SchedulerFlags {
        SchedulerFlags {
            new_tasks: self.new_tasks(),
            active_tasks_check: self.active_tasks_check(),
        }
    }
}

/// What one pass of the loop did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub promoted: usize,
    pub stepped: usize,
    pub archived: usize,
}

pub struct Daemon {
    store: Arc<TaskStore>,
    layout: TaskLayout,
    lookup: Arc<dyn ConfigLookup>,
    connector: Arc<dyn Connector>,
    parsers: ParserRegistry,
    settings: DaemonSettings,
    flags: AdminFlags,
    redirect: LogRedirect,
}

impl Daemon {
    pub fn new(
        store: Arc<TaskStore>,
        layout: TaskLayout,
        lookup: Arc<dyn ConfigLookup>,
        connector: Arc<dyn Connector>,
        settings: DaemonSettings,
        redirect: LogRedirect,
    ) -> Self {
        Self {
            store,
            layout,
            lookup,
            connector,
            parsers: ParserRegistry::default(),
            settings,
            flags: AdminFlags::default(),
            redirect,
        }
    }

    pub fn with_parsers(mut self, parsers: ParserRegistry) -> Self {
        self.parsers = parsers;
        self
    }

    pub fn flags(&self) -> AdminFlags {
        self.flags.clone()
    }

    /// Release locks left behind by a previous run of the daemon.
    pub fn recover(&self) -> Result<usize> {
        let cleared = self.store.clear_locks()?;
        if cleared > 0 {
            warn!(cleared, "cleared task locks left by a previous run");
        }
        Ok(cleared)
    }

    /// Run until `shutdown` flips to true or its sender goes away.
    pub async fn run(
        mut self,
        mut control: mpsc::Receiver<ControlEnvelope>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        self.recover()?;
        let mut control_open = true;
        info!(period = ?self.settings.loop_period, "scheduling daemon started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.tick(now_local()).await {
                error!(error = %e, "scheduler tick failed");
            }

            let pause = tokio::time::sleep(self.settings.loop_period);
            tokio::pin!(pause);
            loop {
                tokio::select! {
                    _ = &mut pause => break,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("scheduling daemon stopping");
                            return Ok(());
                        }
                    }
                    envelope = control.recv(), if control_open => match envelope {
                        Some(envelope) => self.answer(envelope).await,
                        None => control_open = false,
                    },
                }
            }
        }
        info!("scheduling daemon stopping");
        Ok(())
    }

    async fn answer(&mut self, envelope: ControlEnvelope) {
        let response = self.handle_control(&envelope.request).await;
        if envelope.reply.send(response).is_err() {
            debug!(function = %envelope.request.fun, "control caller went away before the answer");
        }
    }

    /// One pass: promote due scheduled tasks, then step due active tasks.
    pub async fn tick(&mut self, now: NaiveDateTime) -> Result<TickReport> {
        let mut report = TickReport::default();
        if self.flags.new_tasks() {
            for task in self.store.due_scheduled(now)? {
                let task_id = task.task_id;
                match self.activate(&task, now) {
                    Ok(()) => report.promoted += 1,
                    Err(e) => error!(task_id, error = %e, "could not activate task"),
                }
            }
        }
        if self.flags.active_tasks_check() {
            for task_id in self.store.due_active(now)? {
                match self.process_active(task_id).await {
                    Ok(Processed::Skipped) => {}
                    Ok(Processed::Stepped) => report.stepped += 1,
                    Ok(Processed::Archived) => {
                        report.stepped += 1;
                        report.archived += 1;
                    }
                    Err(e) => error!(task_id, error = %e, "active task processing failed"),
                }
            }
        }
        Ok(report)
    }

    fn activate(&self, task: &ScheduledTask, now: NaiveDateTime) -> Result<()> {
        let stamp = self.unique_time_stamp(task);
        let mut handler = match TaskHandler::create(
            task.task_id,
            &task.resource,
            &task.app,
            task.params.clone(),
            &stamp,
            &self.layout,
            self.lookup.as_ref(),
        ) {
            Ok(handler) => handler,
            Err(e) => return self.reject(task, &stamp, &e, now),
        };
        handler.save()?;
        self.store.promote(
            task,
            &stamp,
            &handler.task_dir,
            &Progress {
                status: handler.state,
                status_info: handler.status_info.clone(),
                next_check_time: now,
                version: handler.version,
            },
        )?;
        info!(
            task_id = task.task_id,
            resource = %task.resource,
            app = %task.app,
            time_stamp = %stamp,
            "task activated"
        );
        Ok(())
    }

    /// A task whose handler cannot even be built goes straight to the archive.
    fn reject(
        &self,
        task: &ScheduledTask,
        stamp: &str,
        cause: &AkrunError,
        now: NaiveDateTime,
    ) -> Result<()> {
        error!(task_id = task.task_id, error = %cause, "task cannot start");
        let task_dir = self.layout.active_task_dir(&task.resource, &task.app, stamp);
        self.store.promote(
            task,
            stamp,
            &task_dir,
            &Progress {
                status: TaskStatus::Error,
                status_info: cause.to_string(),
                next_check_time: now,
                version: 0,
            },
        )?;
        let row = self
            .store
            .active(task.task_id)?
            .ok_or(AkrunError::TaskNotFound(task.task_id))?;
        if !self.store.try_lock_active(task.task_id, DAEMON_LOCK)? {
            return Err(AkrunError::InvalidRequest(format!(
                "task {} was locked right after activation",
                task.task_id
            )));
        }
        let archived = self.archive(&row, TaskStatus::Error, &cause.to_string());
        self.store.unlock_active(task.task_id, DAEMON_LOCK)?;
        archived
    }

    fn unique_time_stamp(&self, task: &ScheduledTask) -> String {
        let mut at = Local::now().naive_local();
        loop {
            let stamp = time_stamp(at);
            if !self
                .layout
                .active_task_dir(&task.resource, &task.app, &stamp)
                .exists()
            {
                return stamp;
            }
            at += TimeDelta::microseconds(1);
        }
    }

    async fn process_active(&mut self, task_id: TaskId) -> Result<Processed> {
        if !self.store.try_lock_active(task_id, DAEMON_LOCK)? {
            debug!(task_id, "task is locked by another writer, skipping this round");
            return Ok(Processed::Skipped);
        }
        let result = self.step_locked(task_id).await;
        self.store.unlock_active(task_id, DAEMON_LOCK)?;
        result
    }

    async fn step_locked(&mut self, task_id: TaskId) -> Result<Processed> {
        let row = self
            .store
            .active(task_id)?
            .ok_or(AkrunError::TaskNotFound(task_id))?;
        let mut handler = match TaskHandler::load(&task_proc_dir(&row.task_dir), self.lookup.as_ref()) {
            Ok(handler) => handler,
            Err(e) => {
                error!(task_id, error = %e, "cannot resume task");
                self.archive(&row, TaskStatus::Error, &e.to_string())?;
                return Ok(Processed::Archived);
            }
        };

        if !handler.is_terminal() {
            self.redirect.redirect(&handler.log_path())?;
            info!(
                task_id,
                resource = %handler.resource_name,
                app = %handler.app_name,
                state = handler.state.as_str(),
                "stepping task"
            );
            let ctx = StepContext {
                connector: self.connector.as_ref(),
                parsers: &self.parsers,
                retry: &self.settings.retry,
                timeouts: &self.settings.timeouts,
                job_poll_interval: self.settings.job_poll_interval,
                transcript: Some(&self.redirect),
            };
            let outcome = handler.step(&ctx).await;
            let saved = handler.save();
            self.redirect.restore()?;
            saved?;

            match outcome {
                Ok(outcome) if !handler.is_terminal() => {
                    let next = now_local()
                        + TimeDelta::from_std(outcome.next_check_in).unwrap_or(TimeDelta::zero());
                    let progress = Progress {
                        status: handler.state,
                        status_info: handler.status_info.clone(),
                        next_check_time: next,
                        version: handler.version,
                    };
                    if !self.store.record_progress(task_id, DAEMON_LOCK, &progress)? {
                        warn!(task_id, "lost the task lock before recording progress");
                    }
                    return Ok(Processed::Stepped);
                }
                Ok(_) => {}
                Err(e) => {
                    error!(task_id, kind = ?e.kind(), error = %e, "task step failed");
                }
            }
        }

        let status = if handler.is_terminal() {
            handler.state
        } else {
            TaskStatus::Error
        };
        self.archive(&row, status, &handler.status_info)?;
        Ok(Processed::Archived)
    }

    /// Move a finished task out of the active tree and schedule its next run.
    ///
    /// Runs under the daemon's lock. A recurring task whose next run cannot be
    /// computed stays active so an operator edit can repair it.
    fn archive(&self, row: &ActiveTask, status: TaskStatus, status_info: &str) -> Result<()> {
        let task_id = row.task.task_id;
        let next_run = match &row.task.repeat_in {
            Some(repeat_in) => match self.next_run(&row.task, repeat_in) {
                Ok(next_run) => Some(next_run),
                Err(e) => {
                    let wait = self.settings.job_poll_interval.max(self.settings.loop_period);
                    let retry_at = now_local() + TimeDelta::from_std(wait).unwrap_or(TimeDelta::zero());
                    self.store.defer_active(
                        task_id,
                        DAEMON_LOCK,
                        &format!("cannot schedule next run: {e}"),
                        retry_at,
                    )?;
                    return Err(e);
                }
            },
            None => None,
        };

        let target = self
            .layout
            .completed_task_dir(&row.task.resource, &row.task.app, &row.time_stamp);
        let proc_dir = task_proc_dir(&row.task_dir);
        if proc_dir.exists() {
            snapshot::prune(&proc_dir)?;
        }
        if row.task_dir.exists() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&row.task_dir, &target)?;
        }
        let child_id = self.store.complete(
            task_id,
            status,
            status_info,
            &target,
            now_local(),
            next_run.as_ref(),
        )?;
        info!(
            task_id,
            status = status.as_str(),
            dir = %target.display(),
            "task archived"
        );
        if let (Some(child_id), Some(next_run)) = (child_id, &next_run) {
            info!(
                task_id = child_id,
                parent_id = task_id,
                time_to_start = %next_run.time_to_start,
                "next run scheduled"
            );
        }
        Ok(())
    }

    fn next_run(&self, parent: &ScheduledTask, repeat_in: &str) -> Result<NewTask> {
        let period = normalize_period(repeat_in)?;
        let window = StartWindow::from_task_param(&parent.params.task_param)?
            .unwrap_or(self.settings.default_window);
        let now = now_local();
        let anchor = next_occurrence(parent.time_to_start, &period, now)?;
        let mut start = next_start(anchor, &period, window)?;
        if start <= now {
            // sub-day periods can land before now once jitter is applied
            start = anchor;
        }
        Ok(NewTask {
            resource: parent.resource.clone(),
            app: parent.app.clone(),
            time_to_start: start,
            repeat_in: Some(repeat_in.to_string()),
            params: parent.params.clone(),
            parent_id: Some(parent.task_id),
            group_id: parent.group_id.clone(),
        })
    }

    /// Execute one control-plane function.
    pub async fn handle_control(&mut self, request: &ControlRequest) -> ControlResponse {
        let result = match request.fun.as_str() {
            functions::UPDATE_TASK_PARAMETERS => self.update_task_parameters(request).await,
            functions::DELETE_TASK => self.delete_task(request).await,
            functions::DAEMON_NO_NEW_TASKS => {
                self.flags.set_new_tasks(false);
                Ok(ControlResponse::ok("new tasks will not be started"))
            }
            functions::DAEMON_NEW_TASKS_ON => {
                self.flags.set_new_tasks(true);
                Ok(ControlResponse::ok("new tasks will be started"))
            }
            functions::DAEMON_NO_ACTIVE_TASKS_CHECK => {
                self.flags.set_active_tasks_check(false);
                Ok(ControlResponse::ok("active tasks will not be checked"))
            }
            functions::DAEMON_ACTIVE_TASKS_CHECK_ON => {
                self.flags.set_active_tasks_check(true);
                Ok(ControlResponse::ok("active tasks will be checked"))
            }
            functions::DAEMON_STATUS => self.status(),
            other => Err(AkrunError::InvalidRequest(format!("unknown function '{other}'"))),
        };
        info!(function = %request.fun, success = result.is_ok(), "control request handled");
        result.unwrap_or_else(|e| {
            let (kind, message) = e.to_error_code();
            ControlResponse::failure(kind, message)
        })
    }

    fn status(&self) -> Result<ControlResponse> {
        let flags = self.flags.snapshot();
        let scheduled = self.store.list(Some(TaskLocation::Scheduled))?.len();
        let active = self.store.list(Some(TaskLocation::Active))?.len();
        Ok(ControlResponse::ok_with(
            "daemon is running",
            json!({
                "new_tasks": flags.new_tasks,
                "active_tasks_check": flags.active_tasks_check,
                "scheduled": scheduled,
                "active": active,
            }),
        ))
    }

    async fn update_task_parameters(&mut self, request: &ControlRequest) -> Result<ControlResponse> {
        let task_id = task_id_arg(request)?;
        let values = argument(request, 1, "new_param_dict")
            .or_else(|| request.kargs.get("values"))
            .and_then(Value::as_object)
            .ok_or_else(|| AkrunError::InvalidRequest("values must be an object".to_string()))?;
        let update_derived = bool_arg(request, 2, "update_derived_task", true)?;

        if let Some(mut task) = self.store.scheduled(task_id)? {
            apply_values(&mut task, None, values)?;
            self.store.update_scheduled(&task)?;
        } else if let Some(row) = self.store.active(task_id)? {
            let mut task = row.task.clone();
            let mut next_check = row.next_check_time;
            apply_values(&mut task, Some(&mut next_check), values)?;
            self.with_lock(task_id, |store| {
                store.update_active(task_id, DAEMON_LOCK, &task, next_check)
            })
            .await?;
        } else if self.store.completed(task_id)?.is_some() {
            return Err(AkrunError::InvalidRequest(format!(
                "task {task_id} is completed and cannot be updated"
            )));
        } else {
            return Err(AkrunError::TaskNotFound(task_id));
        }

        let mut children = Vec::new();
        if update_derived {
            for child_id in self.store.scheduled_children(task_id)? {
                if let Some(mut child) = self.store.scheduled(child_id)? {
                    apply_values(&mut child, None, values)?;
                    self.store.update_scheduled(&child)?;
                    children.push(child_id);
                }
            }
        }
        Ok(ControlResponse::ok_with(
            format!("task {task_id} updated"),
            json!({ "task_id": task_id, "updated_children": children }),
        ))
    }

    async fn delete_task(&mut self, request: &ControlRequest) -> Result<ControlResponse> {
        let task_id = task_id_arg(request)?;
        let scheduled = bool_arg(request, 1, "remove_from_scheduled_queue", true)?;
        let active = bool_arg(request, 2, "remove_from_active_queue", true)?;
        let derived = bool_arg(request, 3, "remove_derived_task", true)?;

        let mut deleted = Vec::new();
        if scheduled && self.store.delete_scheduled(task_id)? {
            deleted.push(task_id);
        }
        let active_row = if active { self.store.active(task_id)? } else { None };
        if let Some(row) = active_row {
            self.with_lock(task_id, |store| store.delete_active(task_id))
                .await?;
            if row.task_dir.exists() {
                fs::remove_dir_all(&row.task_dir)?;
            }
            deleted.push(task_id);
        }
        if derived {
            for child_id in self.store.scheduled_children(task_id)? {
                if self.store.delete_scheduled(child_id)? {
                    deleted.push(child_id);
                }
            }
        }

        if deleted.is_empty() {
            return Err(match self.store.get(task_id)? {
                Some(record) => AkrunError::InvalidRequest(format!(
                    "task {task_id} is {:?} and was not selected for deletion",
                    record.location
                )),
                None => AkrunError::TaskNotFound(task_id),
            });
        }
        info!(task_id, ?deleted, "tasks deleted");
        Ok(ControlResponse::ok_with(
            format!("task {task_id} deleted"),
            json!({ "deleted": deleted }),
        ))
    }

    /// Run `write` while holding the advisory lock of an active row.
    async fn with_lock<T>(
        &self,
        task_id: TaskId,
        write: impl FnOnce(&TaskStore) -> Result<T>,
    ) -> Result<T> {
        self.store
            .lock_active_when_free(
                task_id,
                DAEMON_LOCK,
                self.settings.lock_poll_interval(),
                self.settings.lock_max_wait,
            )
            .await?;
        let result = write(&self.store);
        self.store.unlock_active(task_id, DAEMON_LOCK)?;
        result
    }
}

enum Processed {
    Skipped,
    Stepped,
    Archived,
}

fn task_id_arg(request: &ControlRequest) -> Result<TaskId> {
    argument(request, 0, "task_id")
        .and_then(Value::as_i64)
        .ok_or_else(|| AkrunError::InvalidRequest("task_id must be an integer".to_string()))
}

fn bool_arg(request: &ControlRequest, idx: usize, name: &str, default: bool) -> Result<bool> {
    match argument(request, idx, name) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(value)) => Ok(*value),
        Some(other) => Err(AkrunError::InvalidRequest(format!(
            "{name} must be a boolean, got {other}"
        ))),
    }
}

/// Apply operator edits to a task row. `next_check` is present for active rows.
fn apply_values(
    task: &mut ScheduledTask,
    mut next_check: Option<&mut NaiveDateTime>,
    values: &Map<String, Value>,
) -> Result<()> {
    for (key, value) in values {
        match (key.as_str(), value) {
            ("time_to_start", Value::String(raw)) if next_check.is_none() => {
                task.time_to_start = parse_time_to_start(Some(raw.as_str()), now_local())?;
            }
            ("next_check_time", Value::String(raw)) => match next_check.as_deref_mut() {
                Some(slot) => *slot = parse_time_to_start(Some(raw.as_str()), now_local())?,
                None => {
                    return Err(AkrunError::InvalidRequest(
                        "next_check_time only applies to active tasks".to_string(),
                    ));
                }
            },
            ("repeat_in", Value::Null) => task.repeat_in = None,
            ("repeat_in", Value::String(raw)) if raw.trim().is_empty() => task.repeat_in = None,
            ("repeat_in", Value::String(raw)) => {
                task.repeat_in = Some(normalize_period(raw)?.formatted());
            }
            ("resource_param", Value::Object(map)) => task.params.resource_param = map.clone(),
            ("app_param", Value::Object(map)) => task.params.app_param = map.clone(),
            ("task_param", Value::Object(map)) => task.params.task_param = map.clone(),
            ("group_id", Value::Null) => task.group_id = None,
            ("group_id", Value::String(raw)) => task.group_id = Some(raw.clone()),
            (key, value) => {
                return Err(AkrunError::InvalidRequest(format!(
                    "cannot set {key} to {value} on task {}",
                    task.task_id
                )));
            }
        }
    }
    StartWindow::from_task_param(&task.params.task_param)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recurrence::parse_time;

    fn scheduled() -> ScheduledTask {
        ScheduledTask {
            task_id: 3,
            resource: "c1".into(),
            app: "hpl".into(),
            time_to_start: parse_time("2030-01-01 00:00:00").unwrap(),
            repeat_in: None,
            params: Default::default(),
            parent_id: None,
            group_id: None,
        }
    }

    fn values(raw: Value) -> Map<String, Value> {
        raw.as_object().cloned().unwrap()
    }

    #[test]
    fn edits_apply_to_scheduled_rows() {
        let mut task = scheduled();
        apply_values(
            &mut task,
            None,
            &values(json!({
                "time_to_start": "2031-02-03 04:05",
                "repeat_in": "7",
                "task_param": {"nodes": 2},
            })),
        )
        .unwrap();
        assert_eq!(task.time_to_start, parse_time("2031-02-03 04:05:00").unwrap());
        assert_eq!(task.repeat_in.as_deref(), Some("0-00-007 00:00:00"));
        assert_eq!(task.params.task_param["nodes"], 2);
    }

    #[test]
    fn window_edits_are_checked_before_they_land() {
        let mut task = scheduled();
        for window in [
            json!({"window_start": "01:00"}),
            json!({"window_end": "05:00"}),
            json!({"window_start": "25:00", "window_end": "05:00"}),
        ] {
            assert!(
                apply_values(&mut task, None, &values(json!({"task_param": window}))).is_err(),
                "{window} should be rejected"
            );
        }
        apply_values(
            &mut task,
            None,
            &values(json!({"task_param": {"window_start": "01:00", "window_end": "05:00"}})),
        )
        .unwrap();
        assert_eq!(task.params.task_param["window_end"], "05:00");
    }

    #[test]
    fn bad_edits_are_rejected() {
        let mut task = scheduled();
        assert!(matches!(
            apply_values(&mut task, None, &values(json!({"repeat_in": "1-0-1 0:0:0"}))),
            Err(AkrunError::AmbiguousPeriod(_))
        ));
        assert!(matches!(
            apply_values(&mut task, None, &values(json!({"repeat_in": "100000000"}))),
            Err(AkrunError::InvalidTimeFormat(_))
        ));
        assert!(matches!(
            apply_values(&mut task, None, &values(json!({"status": "done"}))),
            Err(AkrunError::InvalidRequest(_))
        ));
        assert!(apply_values(&mut task, None, &values(json!({"next_check_time": "12:00"}))).is_err());
    }

    #[test]
    fn active_rows_take_next_check_time_but_not_start() {
        let mut task = scheduled();
        let mut next = parse_time("2030-01-01 00:00:00").unwrap();
        apply_values(
            &mut task,
            Some(&mut next),
            &values(json!({"next_check_time": "2030-01-01 06:30:00"})),
        )
        .unwrap();
        assert_eq!(next, parse_time("2030-01-01 06:30:00").unwrap());
        assert!(
            apply_values(
                &mut task,
                Some(&mut next),
                &values(json!({"time_to_start": "2030-01-02 00:00"}))
            )
            .is_err()
        );
    }

    #[test]
    fn lock_poll_is_a_fraction_of_the_loop() {
        let settings = DaemonSettings {
            loop_period: Duration::from_secs(10),
            ..DaemonSettings::default()
        };
        assert_eq!(settings.lock_poll_interval(), Duration::from_millis(4500));
    }

    #[test]
    fn flags_are_shared_between_clones() {
        let flags = AdminFlags::default();
        let view = flags.clone();
        flags.set_new_tasks(false);
        assert_eq!(
            view.snapshot(),
            SchedulerFlags {
                new_tasks: false,
                active_tasks_check: true
            }
        );
    }
}

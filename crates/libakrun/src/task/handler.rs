use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use akrun_protocol::{ErrorKind, TaskId, TaskStatus};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{error, info, warn};

use super::layout::{TaskLayout, job_files_dir, task_log_path, task_proc_dir};
use super::parser::{ParsedRun, ParserRegistry};
use super::scheduler::{JOB_ID_FILE, JOB_SCRIPT_FILE, JobState, scheduler_for};
use super::script::{JobScript, merge_params, walltime};
use super::snapshot;
use crate::config::{AppConfig, AppKind, ConfigLookup, ResourceConfig, RetryPolicy, SessionTimeouts};
use crate::error::{AkrunError, Result};
use crate::logging::LogRedirect;
use crate::remote::{Connector, RemoteSession, open_with_retry, shell_quote};

// Keeps every upload line well under the canonical-mode tty line limit.
const UPLOAD_CHUNK: usize = 1024;

/// Per-task parameter overrides, merged over the resource and app records.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TaskParams {
    #[serde(default)]
    pub resource_param: Map<String, Value>,
    #[serde(default)]
    pub app_param: Map<String, Value>,
    #[serde(default)]
    pub task_param: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandlerKind {
    AppKernel,
    Bundle { members: Vec<String> },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MemberResult {
    pub name: String,
    pub run: ParsedRun,
}

/// Collaborators a step needs; borrowed from the daemon for one step.
pub struct StepContext<'a> {
    pub connector: &'a dyn Connector,
    pub parsers: &'a ParserRegistry,
    pub retry: &'a RetryPolicy,
    pub timeouts: &'a SessionTimeouts,
    pub job_poll_interval: Duration,
    pub transcript: Option<&'a LogRedirect>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOutcome {
    /// How long the daemon should wait before stepping this task again.
    pub next_check_in: Duration,
}

/// State machine driving one task from creation to a terminal state.
///
/// Serialized as a snapshot between steps. The resource and app records are
/// not part of the snapshot; [`TaskHandler::load`] looks them up by name.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TaskHandler {
    pub task_id: TaskId,
    pub resource_name: String,
    pub app_name: String,
    pub kind: HandlerKind,
    pub time_stamp: String,
    pub task_dir: PathBuf,
    pub remote_dir: String,
    pub params: TaskParams,
    pub state: TaskStatus,
    pub status_info: String,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub job_id: Option<String>,
    /// Consecutive transient failures; reset by any successful step.
    #[serde(default)]
    pub transient_failures: u32,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub results: Vec<MemberResult>,
    #[serde(skip)]
    resource: Option<Arc<ResourceConfig>>,
    #[serde(skip)]
    app: Option<Arc<AppConfig>>,
    #[serde(skip)]
    member_apps: Vec<Arc<AppConfig>>,
}

impl TaskHandler {
    /// Build the handler for a freshly promoted task and create its local directories.
    pub fn create(
        task_id: TaskId,
        resource: &str,
        app: &str,
        params: TaskParams,
        time_stamp: &str,
        layout: &TaskLayout,
        lookup: &dyn ConfigLookup,
    ) -> Result<Self> {
        let resource_cfg = lookup.resource(resource)?;
        let app_cfg = lookup.app(app)?;
        let kind = match app_cfg.kind {
            AppKind::AppKernel => HandlerKind::AppKernel,
            AppKind::Bundle => HandlerKind::Bundle {
                members: app_cfg.members.clone(),
            },
        };
        let task_dir = layout.active_task_dir(resource, app, time_stamp);
        let remote_dir = format!(
            "{}/{resource}/{app}/{time_stamp}",
            resource_cfg.remote_work_dir.trim_end_matches('/')
        );

        let mut handler = Self {
            task_id,
            resource_name: resource.to_string(),
            app_name: app.to_string(),
            kind,
            time_stamp: time_stamp.to_string(),
            task_dir,
            remote_dir,
            params,
            state: TaskStatus::Created,
            status_info: "task created".to_string(),
            error_kind: None,
            job_id: None,
            transient_failures: 0,
            version: 0,
            results: Vec::new(),
            resource: None,
            app: None,
            member_apps: Vec::new(),
        };
        handler.attach(lookup)?;
        fs::create_dir_all(handler.proc_dir())?;
        fs::create_dir_all(job_files_dir(&handler.task_dir))?;
        Ok(handler)
    }

    /// Resume from the highest snapshot in `proc_dir`.
    pub fn load(proc_dir: &Path, lookup: &dyn ConfigLookup) -> Result<Self> {
        let (version, mut handler): (u32, TaskHandler) = snapshot::read_latest(proc_dir)?;
        handler.version = version;
        handler.attach(lookup)?;
        Ok(handler)
    }

    /// Write the next snapshot version.
    pub fn save(&mut self) -> Result<PathBuf> {
        self.version += 1;
        snapshot::write_snapshot(&self.proc_dir(), self.version, self)
    }

    fn attach(&mut self, lookup: &dyn ConfigLookup) -> Result<()> {
        self.resource = Some(lookup.resource(&self.resource_name)?);
        self.app = Some(lookup.app(&self.app_name)?);
        self.member_apps = match &self.kind {
            HandlerKind::AppKernel => Vec::new(),
            HandlerKind::Bundle { members } => members
                .iter()
                .map(|member| lookup.app(member))
                .collect::<Result<_>>()?,
        };
        Ok(())
    }

    pub fn proc_dir(&self) -> PathBuf {
        task_proc_dir(&self.task_dir)
    }

    pub fn log_path(&self) -> PathBuf {
        task_log_path(&self.task_dir)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    fn resource(&self) -> Result<Arc<ResourceConfig>> {
        self.resource.clone().ok_or_else(|| {
            AkrunError::Config(format!("task {} has no resource attached", self.task_id))
        })
    }

    fn app(&self) -> Result<Arc<AppConfig>> {
        self.app
            .clone()
            .ok_or_else(|| AkrunError::Config(format!("task {} has no app attached", self.task_id)))
    }

    /// Parameters visible to templates, lowest precedence first.
    pub fn script_params(&self) -> Result<Map<String, Value>> {
        let resource = self.resource()?;
        let app = self.app()?;
        let defaults = json!({
            "nodes": app.nodes,
            "walltime_limit": app.walltime_limit,
            "walltime": walltime(app.walltime_limit),
        });
        let identity = json!({
            "task_id": self.task_id,
            "resource": self.resource_name,
            "app": self.app_name,
            "time_stamp": self.time_stamp,
            "work_dir": self.remote_dir,
            "job_name": format!("akrun_{}_{}", self.app_name, self.task_id),
        });
        let empty = Map::new();
        Ok(merge_params([
            defaults.as_object().unwrap_or(&empty),
            &resource.params,
            &app.params,
            &self.params.resource_param,
            &self.params.app_param,
            &self.params.task_param,
            identity.as_object().unwrap_or(&empty),
        ]))
    }

    pub fn render_script(&self) -> Result<String> {
        let resource = self.resource()?;
        let app = self.app()?;
        let params = self.script_params()?;
        let members: Vec<(String, String)> = self
            .member_apps
            .iter()
            .map(|member| (member.name.clone(), member.run_script.clone()))
            .collect();
        JobScript {
            resource: &resource,
            app: &app,
            members: &members,
            params: &params,
            remote_dir: &self.remote_dir,
        }
        .render()
    }

    /// Advance by exactly one transition.
    ///
    /// Transient failures are absorbed and rescheduled with backoff until the
    /// retry budget runs out; any other failure moves the task to `Error` and
    /// is returned to the caller.
    pub async fn step(&mut self, ctx: &StepContext<'_>) -> Result<StepOutcome> {
        let from = self.state;
        let attempt = match from {
            TaskStatus::Created => self.prepare(ctx).await,
            TaskStatus::SubmitPending => self.submit(ctx).await,
            TaskStatus::QueuedRemote | TaskStatus::RunningRemote => self.poll(ctx).await,
            TaskStatus::Collecting => self.collect(ctx).await,
            TaskStatus::Done | TaskStatus::Error => Ok(Duration::ZERO),
        };

        match attempt {
            Ok(next_check_in) => {
                self.transient_failures = 0;
                if self.state != from {
                    info!(
                        task_id = self.task_id,
                        from = from.as_str(),
                        to = self.state.as_str(),
                        "task advanced"
                    );
                }
                Ok(StepOutcome { next_check_in })
            }
            Err(e) if e.is_transient() && self.transient_failures + 1 < ctx.retry.max_transient_failures => {
                self.transient_failures += 1;
                let next_check_in = ctx.retry.backoff(self.transient_failures);
                self.status_info = format!(
                    "transient failure {} of {}: {e}",
                    self.transient_failures, ctx.retry.max_transient_failures
                );
                warn!(
                    task_id = self.task_id,
                    state = self.state.as_str(),
                    failures = self.transient_failures,
                    error = %e,
                    "transient failure, will retry"
                );
                Ok(StepOutcome { next_check_in })
            }
            Err(e) => {
                self.fail(&e);
                error!(
                    task_id = self.task_id,
                    state = from.as_str(),
                    error = %e,
                    "task failed"
                );
                Err(e)
            }
        }
    }

    fn fail(&mut self, e: &AkrunError) {
        self.state = TaskStatus::Error;
        self.error_kind = Some(e.kind());
        self.status_info = e.to_string();
    }

    async fn session(&self, ctx: &StepContext<'_>) -> Result<RemoteSession> {
        let resource = self.resource()?;
        let mut session =
            open_with_retry(ctx.connector, &resource.access_target(), ctx.timeouts, ctx.retry).await?;
        if let Some(redirect) = ctx.transcript {
            session.set_transcript(Box::new(redirect.transcript()));
        }
        Ok(session)
    }

    async fn prepare(&mut self, ctx: &StepContext<'_>) -> Result<Duration> {
        let resource = self.resource()?;
        let script = self.render_script()?;
        let mut session = self.session(ctx).await?;

        session.ensure_dir(&resource.remote_work_dir, true).await?;
        session.ensure_dir(&self.remote_dir, true).await?;
        for member in &self.member_apps {
            session
                .ensure_dir(&format!("{}/{}", self.remote_dir, member.name), true)
                .await?;
        }
        self.upload_script(&mut session, &script, ctx).await?;

        self.state = TaskStatus::SubmitPending;
        self.status_info = "job script uploaded".to_string();
        Ok(Duration::ZERO)
    }

    async fn upload_script(
        &self,
        session: &mut RemoteSession,
        script: &str,
        ctx: &StepContext<'_>,
    ) -> Result<()> {
        let timeout = ctx.timeouts.command();
        let encoded = BASE64.encode(script);
        let staging = shell_quote(&format!("{}/{JOB_SCRIPT_FILE}.b64", self.remote_dir));
        let target = shell_quote(&format!("{}/{JOB_SCRIPT_FILE}", self.remote_dir));

        let mut offset = 0;
        while offset < encoded.len() {
            let end = (offset + UPLOAD_CHUNK).min(encoded.len());
            let redirect = if offset == 0 { ">" } else { ">>" };
            session
                .run(
                    &format!("printf '%s' '{}' {redirect} {staging}", &encoded[offset..end]),
                    timeout,
                )
                .await?;
            offset = end;
        }
        let answer = session
            .run(
                &format!("base64 -d {staging} > {target} && rm -f {staging}"),
                timeout,
            )
            .await?;
        if !answer.trim().is_empty() {
            return Err(AkrunError::RemoteJobRejected(format!(
                "job script upload failed: {}",
                answer.trim()
            )));
        }
        Ok(())
    }

    async fn submit(&mut self, ctx: &StepContext<'_>) -> Result<Duration> {
        let resource = self.resource()?;
        let scheduler = scheduler_for(resource.batch_scheduler);
        let timeout = ctx.timeouts.command();

        self.status_info = "submitting job".to_string();
        self.save()?;

        let mut session = self.session(ctx).await?;
        let job_id_file = shell_quote(&format!("{}/{JOB_ID_FILE}", self.remote_dir));
        let previous = session
            .run(&format!("cat {job_id_file} 2>/dev/null"), timeout)
            .await?;
        let job_id = match scheduler.parse_job_id(&previous) {
            Some(job_id) => {
                info!(task_id = self.task_id, job_id = %job_id, "job was already submitted, adopting it");
                job_id
            }
            None => {
                let answer = session
                    .run(&scheduler.submit_command(&self.remote_dir), timeout)
                    .await?;
                scheduler
                    .parse_job_id(&answer)
                    .ok_or_else(|| AkrunError::RemoteJobRejected(answer.trim().to_string()))?
            }
        };

        self.status_info = format!("job {job_id} submitted");
        self.job_id = Some(job_id);
        self.state = TaskStatus::QueuedRemote;
        Ok(ctx.job_poll_interval)
    }

    async fn poll(&mut self, ctx: &StepContext<'_>) -> Result<Duration> {
        let resource = self.resource()?;
        let scheduler = scheduler_for(resource.batch_scheduler);
        let job_id = self
            .job_id
            .clone()
            .ok_or_else(|| AkrunError::RemoteJobRejected("no job id was recorded".to_string()))?;

        let mut session = self.session(ctx).await?;
        let answer = session
            .run(&scheduler.status_command(&job_id), ctx.timeouts.command())
            .await?;
        match scheduler.parse_status(&answer)? {
            JobState::Queued => {
                self.state = TaskStatus::QueuedRemote;
                self.status_info = format!("job {job_id} is queued");
                Ok(ctx.job_poll_interval)
            }
            JobState::Running => {
                self.state = TaskStatus::RunningRemote;
                self.status_info = format!("job {job_id} is running");
                Ok(ctx.job_poll_interval)
            }
            JobState::Finished => {
                self.state = TaskStatus::Collecting;
                self.status_info = format!("job {job_id} finished, collecting output");
                Ok(Duration::ZERO)
            }
        }
    }

    async fn collect(&mut self, ctx: &StepContext<'_>) -> Result<Duration> {
        let app = self.app()?;
        let timeout = ctx.timeouts.command();
        // (result name, output subdirectory, parser)
        let outputs: Vec<(String, Option<String>, String)> = match self.kind {
            HandlerKind::AppKernel => vec![(self.app_name.clone(), None, app.parser.clone())],
            HandlerKind::Bundle { .. } => self
                .member_apps
                .iter()
                .map(|m| (m.name.clone(), Some(m.name.clone()), m.parser.clone()))
                .collect(),
        };

        let mut session = self.session(ctx).await?;
        let mut results = Vec::with_capacity(outputs.len());
        for (name, subdir, parser_name) in outputs {
            let (remote, local) = match &subdir {
                Some(sub) => (
                    format!("{}/{sub}", self.remote_dir),
                    job_files_dir(&self.task_dir).join(sub),
                ),
                None => (self.remote_dir.clone(), job_files_dir(&self.task_dir)),
            };
            fs::create_dir_all(&local)?;
            for stream in ["stdout", "stderr"] {
                let text = session
                    .run(
                        &format!("cat {} 2>/dev/null", shell_quote(&format!("{remote}/{stream}"))),
                        timeout,
                    )
                    .await?;
                fs::write(local.join(stream), text)?;
            }
            let parser = ctx.parsers.get(&parser_name)?;
            let run = parser.parse(&local.join("stdout"), &self.log_path())?;
            results.push(MemberResult { name, run });
        }
        drop(session);

        self.results = results;
        let failures: Vec<String> = self
            .results
            .iter()
            .filter(|r| !r.run.success)
            .map(|r| format!("{}: {}", r.name, r.run.message))
            .collect();
        if !failures.is_empty() {
            return Err(AkrunError::RunFailed(failures.join("; ")));
        }
        self.state = TaskStatus::Done;
        self.status_info = match self.results.as_slice() {
            [only] => only.run.message.clone(),
            all => format!("{} runs finished successfully", all.len()),
        };
        Ok(Duration::ZERO)
    }
}

use std::sync::Arc;
use std::time::Duration;

use akrun_protocol::{
    ErrorKind, MAX_JSON_LINE_BYTES, Request, Response, TaskId, TaskLocation, functions,
};
use futures_util::{SinkExt, StreamExt};
use libakrun::recurrence::{
    StartWindow, format_time, normalize_period, now_local, parse_time_to_start,
};
use libakrun::store::{FRONTEND_LOCK, NewTask};
use libakrun::task::layout::task_log_path;
use libakrun::{AkrunError, ConfigLookup, ControlClient, TaskParams, TaskStore};
use serde_json::{Value, json};
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, info, warn};

/// What the socket handlers share: direct store access for reads and
/// task creation, the control channel for everything the daemon owns.
pub struct FrontEnd {
    pub store: Arc<TaskStore>,
    pub lookup: Arc<dyn ConfigLookup>,
    pub control: ControlClient,
    pub lock_poll: Duration,
    pub lock_max_wait: Duration,
}

/// Serve one client until it disconnects.
pub async fn handle_client(front: Arc<FrontEnd>, stream: UnixStream) -> anyhow::Result<()> {
    let (r, w) = stream.into_split();
    let mut reader = FramedRead::new(r, LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES));
    let mut writer = FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES));

    while let Some(line) = reader.next().await {
        let line = line?;
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => handle_request(&front, request).await,
            Err(e) => Response::error(ErrorKind::InvalidRequest, format!("invalid request: {e}")),
        };
        writer.send(serde_json::to_string(&response)?).await?;
    }
    debug!("client disconnected");
    Ok(())
}

pub async fn handle_request(front: &FrontEnd, request: Request) -> Response {
    let result = match request {
        Request::TaskCreate {
            resource,
            app,
            time_to_start,
            repeat_in,
            resource_param,
            app_param,
            task_param,
            group_id,
        } => create_task(
            front,
            NewTaskRequest {
                resource,
                app,
                time_to_start,
                repeat_in,
                params: TaskParams {
                    resource_param,
                    app_param,
                    task_param,
                },
                group_id,
            },
        ),
        Request::TaskUpdate {
            task_id,
            values,
            update_derived_task,
        } => {
            return Response::from_control(
                front
                    .control
                    .update_task_parameters(task_id, values, update_derived_task)
                    .await,
            );
        }
        Request::TaskDelete {
            task_id,
            scheduled,
            active,
            derived,
        } => {
            return Response::from_control(
                front
                    .control
                    .delete_task(task_id, scheduled, active, derived)
                    .await,
            );
        }
        Request::TaskRecheck {
            task_id,
            next_check_time,
        } => recheck(front, task_id, next_check_time.as_deref()).await,
        Request::TaskGet { task_id } => front.store.get(task_id).and_then(|record| {
            let record = record.ok_or(AkrunError::TaskNotFound(task_id))?;
            Ok(serde_json::to_value(record)?)
        }),
        Request::TaskList { location } => front
            .store
            .list(location)
            .and_then(|records| Ok(json!({ "tasks": serde_json::to_value(records)? }))),
        Request::TaskLog { task_id } => task_log(front, task_id),
        Request::SchedulerNoNewTasks => return daemon_call(front, functions::DAEMON_NO_NEW_TASKS).await,
        Request::SchedulerNewTasksOn => return daemon_call(front, functions::DAEMON_NEW_TASKS_ON).await,
        Request::SchedulerNoActiveTasksCheck => {
            return daemon_call(front, functions::DAEMON_NO_ACTIVE_TASKS_CHECK).await;
        }
        Request::SchedulerActiveTasksCheckOn => {
            return daemon_call(front, functions::DAEMON_ACTIVE_TASKS_CHECK_ON).await;
        }
        Request::SchedulerStatus => return daemon_call(front, functions::DAEMON_STATUS).await,
    };

    match result {
        Ok(data) => Response::ok(Some(data)),
        Err(e) => {
            let (code, message) = e.to_error_code();
            warn!(?code, %message, "request failed");
            Response::error(code, message)
        }
    }
}

async fn daemon_call(front: &FrontEnd, fun: &str) -> Response {
    Response::from_control(front.control.daemon(fun).await)
}

struct NewTaskRequest {
    resource: String,
    app: String,
    time_to_start: Option<String>,
    repeat_in: Option<String>,
    params: TaskParams,
    group_id: Option<String>,
}

fn create_task(front: &FrontEnd, request: NewTaskRequest) -> libakrun::Result<Value> {
    front.lookup.resource(&request.resource)?;
    front.lookup.app(&request.app)?;
    let time_to_start = parse_time_to_start(request.time_to_start.as_deref(), now_local())?;
    let repeat_in = match request.repeat_in.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(normalize_period(raw)?.formatted()),
    };
    StartWindow::from_task_param(&request.params.task_param)?;

    let task_id = front.store.insert_scheduled(&NewTask {
        resource: request.resource,
        app: request.app,
        time_to_start,
        repeat_in: repeat_in.clone(),
        params: request.params,
        parent_id: None,
        group_id: request.group_id,
    })?;
    info!(task_id, time_to_start = %time_to_start, "task scheduled");
    Ok(json!({
        "task_id": task_id,
        "time_to_start": format_time(time_to_start),
        "repeat_in": repeat_in,
    }))
}

/// Move an active task's next check, waiting out the daemon's lock.
async fn recheck(
    front: &FrontEnd,
    task_id: TaskId,
    next_check_time: Option<&str>,
) -> libakrun::Result<Value> {
    let next_check = parse_time_to_start(next_check_time, now_local())?;
    front
        .store
        .lock_active_when_free(task_id, FRONTEND_LOCK, front.lock_poll, front.lock_max_wait)
        .await?;

    let updated = front.store.active(task_id).and_then(|row| {
        let row = row.ok_or(AkrunError::TaskNotFound(task_id))?;
        front
            .store
            .update_active(task_id, FRONTEND_LOCK, &row.task, next_check)
    });
    let unlocked = front.store.unlock_active(task_id, FRONTEND_LOCK);
    if !updated? {
        return Err(AkrunError::TaskNotFound(task_id));
    }
    unlocked?;
    Ok(json!({
        "task_id": task_id,
        "next_check_time": format_time(next_check),
    }))
}

fn task_log(front: &FrontEnd, task_id: TaskId) -> libakrun::Result<Value> {
    let (location, task_dir) = if let Some(row) = front.store.active(task_id)? {
        (TaskLocation::Active, row.task_dir)
    } else if let Some(row) = front.store.completed(task_id)? {
        (TaskLocation::Completed, row.task_dir)
    } else if front.store.scheduled(task_id)?.is_some() {
        return Err(AkrunError::InvalidRequest(format!(
            "task {task_id} has not started yet"
        )));
    } else {
        return Err(AkrunError::TaskNotFound(task_id));
    };
    let path = task_log_path(&task_dir);
    let log = match std::fs::read_to_string(&path) {
        Ok(log) => log,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    Ok(json!({
        "task_id": task_id,
        "location": location,
        "path": path,
        "log": log,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use libakrun::config::{AppConfig, ResourceConfig};
    use libakrun::store::{DAEMON_LOCK, Progress};
    use libakrun::{ControlEnvelope, Registry};
    use akrun_protocol::{ControlResponse, TaskStatus};
    use chrono::TimeDelta;
    use tokio::sync::mpsc;

    fn registry() -> Registry {
        let resource: ResourceConfig = toml::from_str(
            "name = \"cluster1\"\nbatch_scheduler = \"slurm\"\nremote_work_dir = \"/scratch\"",
        )
        .unwrap();
        let app: AppConfig = toml::from_str("name = \"hpl\"").unwrap();
        Registry::new(vec![resource], vec![app]).unwrap()
    }

    fn front_end() -> (FrontEnd, mpsc::Receiver<ControlEnvelope>) {
        let (control, rx) = libakrun::control::channel(4, Duration::from_secs(5));
        let front = FrontEnd {
            store: Arc::new(TaskStore::open_in_memory().unwrap()),
            lookup: Arc::new(registry()),
            control,
            lock_poll: Duration::from_millis(10),
            lock_max_wait: Duration::from_millis(200),
        };
        (front, rx)
    }

    fn create(resource: &str, time_to_start: Option<&str>, repeat_in: Option<&str>) -> Request {
        Request::TaskCreate {
            resource: resource.into(),
            app: "hpl".into(),
            time_to_start: time_to_start.map(str::to_string),
            repeat_in: repeat_in.map(str::to_string),
            resource_param: Map::new(),
            app_param: Map::new(),
            task_param: Map::new(),
            group_id: None,
        }
    }

    fn data(response: Response) -> Value {
        match response {
            Response::Ok { data: Some(data) } => data,
            other => panic!("expected data, got {other:?}"),
        }
    }

    fn error_code(response: Response) -> ErrorKind {
        match response {
            Response::Error { code, .. } => code,
            other => panic!("expected an error, got {other:?}"),
        }
    }

    fn activate(front: &FrontEnd, task_id: TaskId, dir: &std::path::Path) {
        let task = front.store.scheduled(task_id).unwrap().unwrap();
        front
            .store
            .promote(
                &task,
                "2026.01.01.00.00.00.000000",
                dir,
                &Progress {
                    status: TaskStatus::QueuedRemote,
                    status_info: "queued".into(),
                    next_check_time: now_local() + TimeDelta::hours(1),
                    version: 1,
                },
            )
            .unwrap();
    }

    #[tokio::test]
    async fn create_validates_and_normalizes() {
        let (front, _rx) = front_end();
        let created = data(
            handle_request(&front, create("cluster1", Some("2030-01-02 03:04"), Some("1 2:30"))).await,
        );
        assert_eq!(created["time_to_start"], "2030-01-02 03:04:00");
        assert_eq!(created["repeat_in"], "0-00-001 02:30:00");

        let task_id = created["task_id"].as_i64().unwrap();
        let record = data(handle_request(&front, Request::TaskGet { task_id }).await);
        assert_eq!(record["location"], "scheduled");
        assert_eq!(record["resource"], "cluster1");

        let response = handle_request(&front, create("nowhere", None, None)).await;
        assert_eq!(error_code(response), ErrorKind::NotFound);
        let response = handle_request(&front, create("cluster1", Some("tomorrow-ish"), None)).await;
        assert_eq!(error_code(response), ErrorKind::InvalidTimeFormat);
        let response = handle_request(&front, create("cluster1", None, Some("1-0-2 0:0:0"))).await;
        assert_eq!(error_code(response), ErrorKind::AmbiguousPeriod);
    }

    #[tokio::test]
    async fn overlong_repeat_period_is_refused_at_creation() {
        let (front, _rx) = front_end();
        for repeat_in in ["100000000", "999999-0-0 0:0:0"] {
            let response = handle_request(&front, create("cluster1", None, Some(repeat_in))).await;
            assert_eq!(error_code(response), ErrorKind::InvalidTimeFormat);
        }
        assert!(front.store.list(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn half_a_start_window_is_rejected() {
        let (front, _rx) = front_end();
        let mut request = create("cluster1", None, Some("1"));
        if let Request::TaskCreate { task_param, .. } = &mut request {
            task_param.insert("window_start".into(), json!("01:00"));
        }
        let response = handle_request(&front, request).await;
        assert_eq!(error_code(response), ErrorKind::InvalidRequest);
        assert!(front.store.list(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_filters_by_location() {
        let (front, _rx) = front_end();
        let dir = tempfile::tempdir().unwrap();
        for _ in 0..3 {
            handle_request(&front, create("cluster1", None, None)).await;
        }
        activate(&front, 1, dir.path());

        let all = data(handle_request(&front, Request::TaskList { location: None }).await);
        assert_eq!(all["tasks"].as_array().unwrap().len(), 3);
        let active = data(
            handle_request(
                &front,
                Request::TaskList {
                    location: Some(TaskLocation::Active),
                },
            )
            .await,
        );
        let active = active["tasks"].as_array().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0]["task_id"], 1);
    }

    #[tokio::test]
    async fn recheck_moves_the_next_check_and_releases_the_lock() {
        let (front, _rx) = front_end();
        let dir = tempfile::tempdir().unwrap();
        handle_request(&front, create("cluster1", None, None)).await;
        activate(&front, 1, dir.path());

        let response = handle_request(
            &front,
            Request::TaskRecheck {
                task_id: 1,
                next_check_time: Some("2031-05-06 07:08:09".into()),
            },
        )
        .await;
        assert_eq!(data(response)["next_check_time"], "2031-05-06 07:08:09");
        let row = front.store.active(1).unwrap().unwrap();
        assert_eq!(format_time(row.next_check_time), "2031-05-06 07:08:09");
        assert_eq!(row.task_lock, 0);
    }

    #[tokio::test]
    async fn recheck_gives_up_on_a_stale_lock() {
        let (front, _rx) = front_end();
        let dir = tempfile::tempdir().unwrap();
        handle_request(&front, create("cluster1", None, None)).await;
        activate(&front, 1, dir.path());
        assert!(front.store.try_lock_active(1, DAEMON_LOCK).unwrap());

        let response = handle_request(
            &front,
            Request::TaskRecheck {
                task_id: 1,
                next_check_time: None,
            },
        )
        .await;
        assert_eq!(error_code(response), ErrorKind::StaleLock);
        assert_eq!(front.store.active(1).unwrap().unwrap().task_lock, DAEMON_LOCK);

        let response = handle_request(
            &front,
            Request::TaskRecheck {
                task_id: 2,
                next_check_time: None,
            },
        )
        .await;
        assert_eq!(error_code(response), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn log_of_an_active_task() {
        let (front, _rx) = front_end();
        let dir = tempfile::tempdir().unwrap();
        handle_request(&front, create("cluster1", None, None)).await;

        let response = handle_request(&front, Request::TaskLog { task_id: 1 }).await;
        assert_eq!(error_code(response), ErrorKind::InvalidRequest);

        activate(&front, 1, dir.path());
        let log_path = task_log_path(dir.path());
        std::fs::create_dir_all(log_path.parent().unwrap()).unwrap();
        std::fs::write(&log_path, "job submitted\n").unwrap();

        let log = data(handle_request(&front, Request::TaskLog { task_id: 1 }).await);
        assert_eq!(log["location"], "active");
        assert_eq!(log["log"], "job submitted\n");

        let response = handle_request(&front, Request::TaskLog { task_id: 9 }).await;
        assert_eq!(error_code(response), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn daemon_owned_requests_go_through_the_control_channel() {
        let (front, mut rx) = front_end();
        let daemon = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(envelope) = rx.recv().await {
                seen.push(envelope.request.clone());
                let _ = envelope.reply.send(ControlResponse::ok("Task successfully deleted!"));
            }
            seen
        });

        let response = handle_request(
            &front,
            Request::TaskDelete {
                task_id: 4,
                scheduled: true,
                active: false,
                derived: true,
            },
        )
        .await;
        assert_eq!(data(response)["message"], "Task successfully deleted!");
        handle_request(&front, Request::SchedulerNoNewTasks).await;

        drop(front);
        let seen = daemon.await.unwrap();
        assert_eq!(seen[0].fun, functions::DELETE_TASK);
        assert_eq!(seen[0].args, [json!(4)]);
        assert_eq!(seen[0].kargs["remove_from_active_queue"], false);
        assert_eq!(seen[1].fun, functions::DAEMON_NO_NEW_TASKS);
    }
}

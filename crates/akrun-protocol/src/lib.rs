pub mod paths;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Unique identifier of a task, stable across the scheduled/active/completed move.
pub type TaskId = i64;

/// Maximum accepted size of one JSON line on the front-end socket.
pub const MAX_JSON_LINE_BYTES: usize = 1024 * 1024;

/// Names of the operations the daemon answers on its control-plane queue.
pub mod functions {
    pub const UPDATE_TASK_PARAMETERS: &str = "update_task_parameters";
    pub const DELETE_TASK: &str = "delete_task";
    pub const DAEMON_NO_NEW_TASKS: &str = "daemon_no_new_tasks";
    pub const DAEMON_NEW_TASKS_ON: &str = "daemon_new_tasks_on";
    pub const DAEMON_NO_ACTIVE_TASKS_CHECK: &str = "daemon_no_active_tasks_check";
    pub const DAEMON_ACTIVE_TASKS_CHECK_ON: &str = "daemon_active_tasks_check_on";
    pub const DAEMON_STATUS: &str = "daemon_status";
}

/// Control-plane request: a function name plus positional and keyword arguments.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ControlRequest {
    pub fun: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kargs: Map<String, Value>,
}

impl ControlRequest {
    pub fn new(fun: impl Into<String>) -> Self {
        Self {
            fun: fun.into(),
            args: Vec::new(),
            kargs: Map::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn karg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.kargs.insert(key.to_string(), value.into());
        self
    }
}

/// Control-plane response placed on the daemon's outbound queue.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ControlResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ControlResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            kind: None,
            data: None,
        }
    }

    pub fn ok_with(message: impl Into<String>, data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::ok(message)
        }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            kind: Some(kind),
            data: None,
        }
    }
}

/// Operator-visible error classification.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConnectionTimeout,
    AuthError,
    RefusedConnection,
    RemoteCommandTimeout,
    DirectoryNotFound,
    DirectoryNotWritable,
    SnapshotNotFound,
    AmbiguousPeriod,
    InvalidTimeFormat,
    StaleLock,
    RemoteJobRejected,
    RunFailed,
    Unparsable,
    NotFound,
    InvalidRequest,
    ServerError,
}

/// States of the task lifecycle state machine.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    SubmitPending,
    QueuedRemote,
    RunningRemote,
    Collecting,
    Done,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::SubmitPending => "submit_pending",
            TaskStatus::QueuedRemote => "queued_remote",
            TaskStatus::RunningRemote => "running_remote",
            TaskStatus::Collecting => "collecting",
            TaskStatus::Done => "done",
            TaskStatus::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "created" => TaskStatus::Created,
            "submit_pending" => TaskStatus::SubmitPending,
            "queued_remote" => TaskStatus::QueuedRemote,
            "running_remote" => TaskStatus::RunningRemote,
            "collecting" => TaskStatus::Collecting,
            "done" => TaskStatus::Done,
            "error" => TaskStatus::Error,
            _ => return None,
        })
    }
}

/// Which table currently holds the authoritative row of a task.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskLocation {
    Scheduled,
    Active,
    Completed,
}

/// Flattened view of a task row, as returned by list/get requests.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub location: TaskLocation,
    pub resource: String,
    pub app: String,
    #[serde(default)]
    pub time_to_start: Option<String>,
    #[serde(default)]
    pub repeat_in: Option<String>,
    #[serde(default)]
    pub time_stamp: Option<String>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub status_info: Option<String>,
    #[serde(default)]
    pub next_check_time: Option<String>,
    #[serde(default)]
    pub parent_id: Option<TaskId>,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub task_lock: i64,
}

/// Snapshot of the daemon's administrative flags.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerFlags {
    pub new_tasks: bool,
    pub active_tasks_check: bool,
}

/// Front-end requests sent as JSON-lines over the Unix socket.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    TaskCreate {
        resource: String,
        app: String,
        #[serde(default)]
        time_to_start: Option<String>,
        #[serde(default)]
        repeat_in: Option<String>,
        #[serde(default)]
        resource_param: Map<String, Value>,
        #[serde(default)]
        app_param: Map<String, Value>,
        #[serde(default)]
        task_param: Map<String, Value>,
        #[serde(default)]
        group_id: Option<String>,
    },
    TaskUpdate {
        task_id: TaskId,
        values: Map<String, Value>,
        #[serde(default = "default_true")]
        update_derived_task: bool,
    },
    TaskDelete {
        task_id: TaskId,
        #[serde(default = "default_true")]
        scheduled: bool,
        #[serde(default = "default_true")]
        active: bool,
        #[serde(default = "default_true")]
        derived: bool,
    },
    TaskRecheck {
        task_id: TaskId,
        #[serde(default)]
        next_check_time: Option<String>,
    },
    TaskGet {
        task_id: TaskId,
    },
    TaskList {
        #[serde(default)]
        location: Option<TaskLocation>,
    },
    TaskLog {
        task_id: TaskId,
    },
    SchedulerNoNewTasks,
    SchedulerNewTasksOn,
    SchedulerNoActiveTasksCheck,
    SchedulerActiveTasksCheckOn,
    SchedulerStatus,
}

/// Front-end responses.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    Error {
        message: String,
        code: ErrorKind,
    },
}

impl Response {
    pub fn ok(data: Option<Value>) -> Self {
        Response::Ok { data }
    }

    pub fn error(code: ErrorKind, message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
            code,
        }
    }

    /// Lift a control-plane answer into a front-end response.
    pub fn from_control(resp: ControlResponse) -> Self {
        if resp.success {
            let mut data = resp.data.unwrap_or_else(|| Value::Object(Map::new()));
            if let (Value::Object(obj), Some(message)) = (&mut data, resp.message) {
                obj.insert("message".to_string(), Value::String(message));
            }
            Response::Ok { data: Some(data) }
        } else {
            Response::Error {
                message: resp
                    .message
                    .unwrap_or_else(|| "request failed".to_string()),
                code: resp.kind.unwrap_or(ErrorKind::ServerError),
            }
        }
    }
}

fn default_true() -> bool {
    true
}

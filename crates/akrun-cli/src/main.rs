mod client;
mod commands;

use std::path::PathBuf;

use akrun_protocol::{Request, TaskId, TaskLocation};
use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "akrun", about = "Schedule and inspect recurring benchmark runs", version)]
struct Cli {
    /// Server socket (defaults to $XDG_RUNTIME_DIR/akrun.sock)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the akrun server daemon
    Server {
        #[command(subcommand)]
        action: ServerAction,
    },

    /// Create, inspect and edit tasks
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },

    /// Pause or resume the scheduling daemon
    Scheduler {
        #[command(subcommand)]
        action: SchedulerAction,
    },
}

#[derive(Subcommand)]
enum ServerAction {
    /// Start the daemon
    Start {
        /// Run in foreground (don't daemonize)
        #[arg(long)]
        foreground: bool,

        /// Config file passed to the server
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Stop the daemon
    Stop(PidFileArgs),
    /// Check daemon status
    Status(PidFileArgs),
}

#[derive(Args)]
struct PidFileArgs {
    /// Config file the server was started with; its `pid_file` is used
    #[arg(long)]
    config: Option<PathBuf>,

    /// Pid file of the server (overrides --config)
    #[arg(long)]
    pid_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum TaskAction {
    /// Schedule a new task
    Create {
        resource: String,
        app: String,

        /// `YYYY-MM-DD HH:MM[:SS]`, a date, or a time of day; empty means now
        #[arg(long)]
        time_to_start: Option<String>,

        /// Repeat period, e.g. `1` (daily), `7 0:0`, `0-1-0 0:0:0` (monthly)
        #[arg(long)]
        repeat_in: Option<String>,

        #[arg(long)]
        group_id: Option<String>,

        /// Resource parameter `KEY=VALUE` (repeatable)
        #[arg(long = "resource-param", value_name = "KEY=VALUE")]
        resource_param: Vec<String>,

        /// App parameter `KEY=VALUE` (repeatable)
        #[arg(long = "app-param", value_name = "KEY=VALUE")]
        app_param: Vec<String>,

        /// Task parameter `KEY=VALUE` (repeatable)
        #[arg(long = "task-param", value_name = "KEY=VALUE")]
        task_param: Vec<String>,
    },

    /// List tasks
    List {
        #[arg(long, value_enum)]
        location: Option<Location>,
    },

    /// Show one task
    Get { task_id: TaskId },

    /// Edit a scheduled or active task
    Update {
        task_id: TaskId,

        /// Field to change, `KEY=VALUE`; VALUE is JSON or a plain string (repeatable)
        #[arg(long = "set", value_name = "KEY=VALUE", required = true)]
        set: Vec<String>,

        /// Leave derived (repeat) tasks untouched
        #[arg(long)]
        no_derived: bool,
    },

    /// Delete a task
    Delete {
        task_id: TaskId,

        /// Keep the scheduled row
        #[arg(long)]
        keep_scheduled: bool,

        /// Keep the active row
        #[arg(long)]
        keep_active: bool,

        /// Keep derived (repeat) tasks
        #[arg(long)]
        keep_derived: bool,
    },

    /// Move the next check of an active task
    Recheck {
        task_id: TaskId,

        /// When to check; defaults to now
        #[arg(long)]
        at: Option<String>,
    },

    /// Print a task's log
    Log { task_id: TaskId },
}

#[derive(Subcommand)]
enum SchedulerAction {
    /// Stop promoting scheduled tasks
    PauseNew,
    /// Resume promoting scheduled tasks
    ResumeNew,
    /// Stop stepping active tasks
    PauseCheck,
    /// Resume stepping active tasks
    ResumeCheck,
    /// Show the daemon's flags and queue sizes
    Status,
}

#[derive(Clone, Copy, ValueEnum)]
enum Location {
    Scheduled,
    Active,
    Completed,
}

impl From<Location> for TaskLocation {
    fn from(location: Location) -> Self {
        match location {
            Location::Scheduled => TaskLocation::Scheduled,
            Location::Active => TaskLocation::Active,
            Location::Completed => TaskLocation::Completed,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let socket = cli
        .socket
        .unwrap_or_else(akrun_protocol::paths::default_socket_path);

    match cli.command {
        Commands::Server { action } => match action {
            ServerAction::Start { foreground, config } => {
                commands::server_start(foreground, config, &socket).await
            }
            ServerAction::Stop(args) => {
                let pid_file = commands::resolve_pid_file(args.pid_file, args.config.as_deref())?;
                commands::server_stop(&pid_file).await
            }
            ServerAction::Status(args) => {
                let pid_file = commands::resolve_pid_file(args.pid_file, args.config.as_deref())?;
                commands::server_status(&pid_file)
            }
        },
        Commands::Task { action } => {
            let request = match action {
                TaskAction::Create {
                    resource,
                    app,
                    time_to_start,
                    repeat_in,
                    group_id,
                    resource_param,
                    app_param,
                    task_param,
                } => Request::TaskCreate {
                    resource,
                    app,
                    time_to_start,
                    repeat_in,
                    resource_param: commands::parse_assignments(&resource_param)?,
                    app_param: commands::parse_assignments(&app_param)?,
                    task_param: commands::parse_assignments(&task_param)?,
                    group_id,
                },
                TaskAction::List { location } => Request::TaskList {
                    location: location.map(Into::into),
                },
                TaskAction::Get { task_id } => Request::TaskGet { task_id },
                TaskAction::Update {
                    task_id,
                    set,
                    no_derived,
                } => Request::TaskUpdate {
                    task_id,
                    values: commands::parse_assignments(&set)?,
                    update_derived_task: !no_derived,
                },
                TaskAction::Delete {
                    task_id,
                    keep_scheduled,
                    keep_active,
                    keep_derived,
                } => Request::TaskDelete {
                    task_id,
                    scheduled: !keep_scheduled,
                    active: !keep_active,
                    derived: !keep_derived,
                },
                TaskAction::Recheck { task_id, at } => Request::TaskRecheck {
                    task_id,
                    next_check_time: at,
                },
                TaskAction::Log { task_id } => Request::TaskLog { task_id },
            };
            commands::send(&socket, request).await
        }
        Commands::Scheduler { action } => {
            let request = match action {
                SchedulerAction::PauseNew => Request::SchedulerNoNewTasks,
                SchedulerAction::ResumeNew => Request::SchedulerNewTasksOn,
                SchedulerAction::PauseCheck => Request::SchedulerNoActiveTasksCheck,
                SchedulerAction::ResumeCheck => Request::SchedulerActiveTasksCheckOn,
                SchedulerAction::Status => Request::SchedulerStatus,
            };
            commands::send(&socket, request).await
        }
    }
}

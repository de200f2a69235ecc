use akrun_protocol::{ErrorKind, Request, Response, TaskLocation};
use anyhow::{Context, Result, bail};
use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::json;
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

fn spawn_mock_server<F>(socket_path: PathBuf, handler: F) -> thread::JoinHandle<Result<()>>
where
    F: FnOnce(Request) -> Result<Response> + Send + 'static,
{
    if socket_path.exists() {
        let _ = fs::remove_file(&socket_path);
    }
    let listener = UnixListener::bind(&socket_path);

    thread::spawn(move || {
        let listener = listener.context("failed to bind mock socket")?;
        let (stream, _) = listener.accept().context("failed to accept client")?;
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .context("failed to set read timeout")?;

        let read_half = stream.try_clone().context("failed to clone stream")?;
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(stream);

        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            bail!("client disconnected before request");
        }
        let req: Request = serde_json::from_str(line.trim_end())?;
        let response = handler(req)?;
        writeln!(writer, "{}", serde_json::to_string(&response)?)?;
        writer.flush()?;
        Ok(())
    })
}

fn cli_bin() -> Command {
    cargo_bin_cmd!("akrun")
}

fn socket_for(temp: &Path) -> PathBuf {
    temp.join("akrun.sock")
}

#[test]
fn task_create_sends_params_and_prints_the_answer() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let socket_path = socket_for(temp.path());

    let server = spawn_mock_server(socket_path.clone(), |req| match req {
        Request::TaskCreate {
            resource,
            app,
            repeat_in,
            task_param,
            app_param,
            ..
        } => {
            assert_eq!(resource, "cluster1");
            assert_eq!(app, "hpl");
            assert_eq!(repeat_in.as_deref(), Some("1"));
            assert_eq!(task_param["window_start"], "01:00");
            assert_eq!(app_param["nodes"], 4);
            Ok(Response::ok(Some(json!({"task_id": 17}))))
        }
        other => bail!("expected TaskCreate, got {other:?}"),
    });

    let output = cli_bin()
        .arg("--socket")
        .arg(&socket_path)
        .args(["task", "create", "cluster1", "hpl", "--repeat-in", "1"])
        .args(["--task-param", "window_start=01:00", "--app-param", "nodes=4"])
        .output()
        .context("failed to run akrun task create")?;

    assert!(
        output.status.success(),
        "cli failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(String::from_utf8_lossy(&output.stdout).contains("\"task_id\": 17"));
    server.join().expect("mock server thread panicked")?;
    Ok(())
}

#[test]
fn task_list_passes_the_location() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let socket_path = socket_for(temp.path());

    let server = spawn_mock_server(socket_path.clone(), |req| match req {
        Request::TaskList {
            location: Some(TaskLocation::Completed),
        } => Ok(Response::ok(Some(json!({"tasks": []})))),
        other => bail!("expected TaskList of completed tasks, got {other:?}"),
    });

    let output = cli_bin()
        .arg("--socket")
        .arg(&socket_path)
        .args(["task", "list", "--location", "completed"])
        .output()?;
    assert!(output.status.success());
    server.join().expect("mock server thread panicked")?;
    Ok(())
}

#[test]
fn task_delete_flags_map_to_queues() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let socket_path = socket_for(temp.path());

    let server = spawn_mock_server(socket_path.clone(), |req| match req {
        Request::TaskDelete {
            task_id: 5,
            scheduled: true,
            active: false,
            derived: true,
        } => Ok(Response::ok(Some(json!({"message": "Task successfully deleted!"})))),
        other => bail!("unexpected request {other:?}"),
    });

    let output = cli_bin()
        .arg("--socket")
        .arg(&socket_path)
        .args(["task", "delete", "5", "--keep-active"])
        .output()?;
    assert!(output.status.success());
    server.join().expect("mock server thread panicked")?;
    Ok(())
}

#[test]
fn task_log_prints_raw_text() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let socket_path = socket_for(temp.path());

    let server = spawn_mock_server(socket_path.clone(), |req| match req {
        Request::TaskLog { task_id: 3 } => {
            Ok(Response::ok(Some(json!({"task_id": 3, "log": "job 42 submitted\n"}))))
        }
        other => bail!("unexpected request {other:?}"),
    });

    let output = cli_bin()
        .arg("--socket")
        .arg(&socket_path)
        .args(["task", "log", "3"])
        .output()?;
    assert_eq!(String::from_utf8_lossy(&output.stdout), "job 42 submitted\n");
    server.join().expect("mock server thread panicked")?;
    Ok(())
}

#[test]
fn server_errors_fail_the_command() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let socket_path = socket_for(temp.path());

    let server = spawn_mock_server(socket_path.clone(), |req| match req {
        Request::SchedulerStatus => Ok(Response::error(
            ErrorKind::ServerError,
            "scheduling daemon is not running",
        )),
        other => bail!("unexpected request {other:?}"),
    });

    let output = cli_bin()
        .arg("--socket")
        .arg(&socket_path)
        .args(["scheduler", "status"])
        .output()?;
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("scheduling daemon is not running"), "{stderr}");
    server.join().expect("mock server thread panicked")?;
    Ok(())
}

#[test]
fn missing_server_is_reported() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let output = cli_bin()
        .arg("--socket")
        .arg(socket_for(temp.path()))
        .args(["task", "get", "1"])
        .output()?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("not running"));
    Ok(())
}

#[test]
fn server_status_reads_the_configured_pid_file() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let pid_file = temp.path().join("run/akrun.pid");
    fs::create_dir_all(pid_file.parent().unwrap())?;
    fs::write(&pid_file, std::process::id().to_string())?;
    let config = temp.path().join("server.toml");
    fs::write(&config, format!("pid_file = {:?}\n", pid_file.display().to_string()))?;

    let output = cli_bin()
        .args(["server", "status", "--config"])
        .arg(&config)
        .output()?;
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains(&format!("is running (pid: {})", std::process::id())),
        "{stdout}"
    );

    let output = cli_bin()
        .args(["server", "status", "--pid-file"])
        .arg(temp.path().join("other.pid"))
        .output()?;
    assert!(String::from_utf8_lossy(&output.stdout).contains("is not running"));
    Ok(())
}

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use akrun_protocol::{Request, paths};
use anyhow::{Context, bail};
use serde_json::{Map, Value};

use crate::client::AkrunClient;

/// Start the server daemon.
pub async fn server_start(
    foreground: bool,
    config: Option<PathBuf>,
    socket: &Path,
) -> anyhow::Result<()> {
    let mut args: Vec<OsString> = vec!["--socket".into(), socket.as_os_str().to_owned()];
    if let Some(config) = config {
        args.push("--config".into());
        args.push(config.into_os_string());
    }

    if foreground {
        let status = tokio::process::Command::new("akrun-server")
            .args(&args)
            .status()
            .await?;
        std::process::exit(status.code().unwrap_or(1));
    } else {
        let child = std::process::Command::new("akrun-server")
            .args(&args)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .stdin(std::process::Stdio::null())
            .spawn()
            .context("failed to spawn akrun-server")?;

        println!("akrun server started (pid: {})", child.id());
        Ok(())
    }
}

fn read_pid(pid_path: &Path) -> anyhow::Result<Option<i32>> {
    if !pid_path.exists() {
        return Ok(None);
    }
    let pid_str = std::fs::read_to_string(pid_path)?;
    Ok(Some(pid_str.trim().parse()?))
}

/// Pid file of a running server: `--pid-file`, else the `pid_file` of its
/// config, else the default location.
pub fn resolve_pid_file(pid_file: Option<PathBuf>, config: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(pid_file) = pid_file {
        return Ok(pid_file);
    }
    let Some(config) = config else {
        return Ok(paths::pid_file_path());
    };
    let contents = std::fs::read_to_string(config)
        .with_context(|| format!("failed to read {}", config.display()))?;
    let table: toml::Table = contents
        .parse()
        .with_context(|| format!("invalid config {}", config.display()))?;
    match table.get("pid_file") {
        None => Ok(paths::pid_file_path()),
        Some(toml::Value::String(path)) => Ok(PathBuf::from(path)),
        Some(other) => bail!("pid_file in {} must be a path, got {other}", config.display()),
    }
}

/// Stop the server daemon.
pub async fn server_stop(pid_path: &Path) -> anyhow::Result<()> {
    match read_pid(pid_path)? {
        Some(pid) => {
            // SAFETY: sending a signal has no memory-safety preconditions
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            println!("akrun server stopped (pid: {pid})");
        }
        None => println!("akrun server is not running"),
    }
    Ok(())
}

/// Check server status.
pub fn server_status(pid_path: &Path) -> anyhow::Result<()> {
    match read_pid(pid_path)? {
        // SAFETY: signal 0 only probes for the process
        Some(pid) if unsafe { libc::kill(pid, 0) } == 0 => {
            println!("akrun server is running (pid: {pid})");
        }
        Some(_) => {
            println!("akrun server is not running (stale pid file)");
            let _ = std::fs::remove_file(pid_path);
        }
        None => println!("akrun server is not running"),
    }
    Ok(())
}

/// Send one request and print its data as JSON.
pub async fn send(socket: &Path, request: Request) -> anyhow::Result<()> {
    let is_log = matches!(request, Request::TaskLog { .. });
    let mut client = AkrunClient::connect(socket).await?;
    let data = client.request(&request).await?;

    match data {
        Some(data) if is_log => print!("{}", data["log"].as_str().unwrap_or_default()),
        Some(data) => println!("{}", serde_json::to_string_pretty(&data)?),
        None => {}
    }
    Ok(())
}

/// Parse `KEY=VALUE` pairs; VALUE is taken as JSON when it parses, else as a string.
pub fn parse_assignments(pairs: &[String]) -> anyhow::Result<Map<String, Value>> {
    let mut map = Map::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("expected KEY=VALUE, got '{pair}'");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("empty key in '{pair}'");
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        map.insert(key.to_string(), value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn assignments_take_json_or_strings() {
        let map = parse_assignments(&[
            "nodes=4".to_string(),
            "repeat_in=1 2:30".to_string(),
            "task_param={\"window_start\":\"01:00\"}".to_string(),
            "next_check_time=".to_string(),
        ])
        .unwrap();
        assert_eq!(map["nodes"], json!(4));
        assert_eq!(map["repeat_in"], json!("1 2:30"));
        assert_eq!(map["task_param"]["window_start"], "01:00");
        assert_eq!(map["next_check_time"], json!(""));
    }

    #[test]
    fn pid_file_comes_from_the_flag_then_the_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("server.toml");
        std::fs::write(&config, "pid_file = \"/run/bench/akrun.pid\"\nloop_period_secs = 2.0\n").unwrap();

        assert_eq!(
            resolve_pid_file(Some(PathBuf::from("/tmp/x.pid")), Some(&config)).unwrap(),
            PathBuf::from("/tmp/x.pid")
        );
        assert_eq!(
            resolve_pid_file(None, Some(&config)).unwrap(),
            PathBuf::from("/run/bench/akrun.pid")
        );
        assert_eq!(resolve_pid_file(None, None).unwrap(), paths::pid_file_path());

        std::fs::write(&config, "loop_period_secs = 2.0\n").unwrap();
        assert_eq!(resolve_pid_file(None, Some(&config)).unwrap(), paths::pid_file_path());
        std::fs::write(&config, "pid_file = 3\n").unwrap();
        assert!(resolve_pid_file(None, Some(&config)).is_err());
        assert!(resolve_pid_file(None, Some(&dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn malformed_assignments_are_rejected() {
        assert!(parse_assignments(&["nodes".to_string()]).is_err());
        assert!(parse_assignments(&["=4".to_string()]).is_err());
    }
}

use std::io::Read;

use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{AccessTarget, Connector, RemoteChannel, RemoteProcess};
use crate::error::{AkrunError, Result};

/// Launches the configured access program (normally `ssh`) on a pseudo-terminal.
#[derive(Debug, Clone, Default)]
pub struct SshConnector;

struct PtyProcess {
    child: Box<dyn Child + Send + Sync>,
    // dropping the master hangs up the terminal
    _master: Box<dyn MasterPty + Send>,
}

impl RemoteProcess for PtyProcess {
    fn terminate(&mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }
        if let Err(e) = self.child.kill() {
            debug!(error = %e, "failed to kill remote access process");
        }
        let _ = self.child.wait();
    }
}

impl SshConnector {
    fn command(target: &AccessTarget, command: Option<&str>) -> CommandBuilder {
        let program = if target.method.trim().is_empty() {
            "ssh"
        } else {
            target.method.trim()
        };
        let mut parts = program.split_whitespace();
        let mut cmd = CommandBuilder::new(parts.next().unwrap_or("ssh"));
        cmd.args(parts);
        if let Some(key) = &target.private_key_file {
            cmd.args(["-i", key.as_str()]);
        }
        match &target.username {
            Some(user) => cmd.arg(format!("{user}@{}", target.host)),
            None => cmd.arg(&target.host),
        }
        if let Some(command) = command {
            cmd.arg(command);
        }
        cmd.env("TERM", "dumb");
        cmd
    }
}

impl Connector for SshConnector {
    fn connect(&self, target: &AccessTarget, command: Option<&str>) -> Result<RemoteChannel> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: 50,
                cols: 200,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| AkrunError::Pty(e.to_string()))?;

        let child = pair
            .slave
            .spawn_command(Self::command(target, command))
            .map_err(|e| AkrunError::Pty(e.to_string()))?;
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| AkrunError::Pty(e.to_string()))?;
        let input = pair
            .master
            .take_writer()
            .map_err(|e| AkrunError::Pty(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let host = target.host.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // EIO is how a pty reports that the child hung up
                        if e.raw_os_error() != Some(libc::EIO) {
                            warn!(host = %host, error = %e, "remote terminal read failed");
                        }
                        break;
                    }
                }
            }
        });

        Ok(RemoteChannel {
            input,
            output: rx,
            process: Some(Box::new(PtyProcess {
                child,
                _master: pair.master,
            })),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(builder: &CommandBuilder) -> Vec<String> {
        builder
            .get_argv()
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn builds_ssh_command_line() {
        let target = AccessTarget {
            host: "login.cluster".into(),
            method: "ssh -p 2222".into(),
            username: Some("bench".into()),
            private_key_file: Some("/keys/id".into()),
            ..AccessTarget::default()
        };
        let cmd = SshConnector::command(&target, Some("echo hi"));
        assert_eq!(
            argv(&cmd),
            ["ssh", "-p", "2222", "-i", "/keys/id", "bench@login.cluster", "echo hi"]
        );
    }

    #[test]
    fn defaults_to_plain_ssh() {
        let target = AccessTarget {
            host: "node".into(),
            ..AccessTarget::default()
        };
        assert_eq!(argv(&SshConnector::command(&target, None)), ["ssh", "node"]);
    }
}

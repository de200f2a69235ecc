use std::io::Write;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{AccessTarget, Connector, RemoteChannel, RemoteProcess};
use crate::config::SessionTimeouts;
use crate::error::{AkrunError, Result};

/// Echoed right before a command's output.
pub const START_SENTINEL: &str = "AkRuN_StArTeD_ExEcUtIoN";
/// Echoed right after a command's output.
pub const END_SENTINEL: &str = "AkRuN_ExEcUtEd_SuCcEsSfUlLy";

const PROBE_TEXT: &str = "AkRuN_PrObInG_ThE_PrOmPt";
const TEST_WRITE_FILE: &str = "akrun_test_write";

// Gives the remote side time to turn terminal echo off before a secret is typed.
const SECRET_ECHO_DELAY: Duration = Duration::from_millis(250);
const PROMPT_SETTLE_DELAY: Duration = Duration::from_millis(100);

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b[^m]*m").expect("static ansi pattern"));
static HOST_KEY_PROMPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Are you sure you want to continue connecting").expect("static host key pattern")
});
static PASSWORD_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[Pp]assword:").expect("static password pattern"));
static PASSPHRASE_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Enter passphrase for key").expect("static passphrase pattern"));
static SHELL_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[#$>]\s*").expect("static shell prompt pattern"));

/// Outcome of waiting on the output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expectation {
    Matched(usize),
    Eof,
    Timeout,
}

/// Result of a directory accessibility probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirStatus {
    Writable,
    NotWritable,
    Missing,
}

/// An authenticated shell on a remote access node.
///
/// Owned by one task step at a time; dropping it terminates the login.
pub struct RemoteSession {
    host: String,
    input: Box<dyn Write + Send>,
    output: mpsc::UnboundedReceiver<Vec<u8>>,
    process: Option<Box<dyn RemoteProcess>>,
    /// Received text not yet consumed by a match.
    buffer: String,
    /// Text preceding the last match, or everything left at EOF/timeout.
    before: String,
    closed: bool,
    prompt: Regex,
    timeouts: SessionTimeouts,
    transcript: Option<Box<dyn Write + Send>>,
}

impl RemoteSession {
    fn attach(channel: RemoteChannel, host: &str, timeouts: SessionTimeouts) -> Self {
        Self {
            host: host.to_string(),
            input: channel.input,
            output: channel.output,
            process: channel.process,
            buffer: String::new(),
            before: String::new(),
            closed: false,
            prompt: SHELL_PROMPT.clone(),
            timeouts,
            transcript: None,
        }
    }

    /// Log in and prime the shell with a unique prompt.
    pub async fn open(
        connector: &dyn Connector,
        target: &AccessTarget,
        timeouts: SessionTimeouts,
    ) -> Result<Self> {
        let channel = connector.connect(target, None)?;
        let mut session = Self::attach(channel, &target.host, timeouts);
        session.log_in(target, false).await?;
        session.prime_prompt().await?;
        info!(host = %target.host, "remote session ready");
        Ok(session)
    }

    /// Run a single command through a fresh login that closes afterwards.
    ///
    /// The remote side closing the channel is the expected way for this to end.
    pub async fn run_once(
        connector: &dyn Connector,
        target: &AccessTarget,
        command: &str,
        timeouts: SessionTimeouts,
    ) -> Result<String> {
        let wrapped = format!("echo {START_SENTINEL};{command};echo {END_SENTINEL}");
        let channel = connector.connect(target, Some(&wrapped))?;
        let mut session = Self::attach(channel, &target.host, timeouts);
        session.log_in(target, true).await?;

        let finished = session
            .before
            .lines()
            .rev()
            .filter(|line| !line.trim().is_empty())
            .take(3)
            .any(|line| line.trim_end().ends_with(END_SENTINEL));
        if !finished {
            return Err(AkrunError::RefusedConnection {
                host: session.host.clone(),
            });
        }
        Ok(clean_output(&extract_between_sentinels(&session.before)))
    }

    /// Mirror everything received from the remote side into `sink`.
    pub fn set_transcript(&mut self, sink: Box<dyn Write + Send>) {
        self.transcript = Some(sink);
    }

    async fn log_in(&mut self, target: &AccessTarget, one_shot: bool) -> Result<()> {
        let mut patterns: Vec<&Regex> =
            vec![&*HOST_KEY_PROMPT, &*PASSWORD_PROMPT, &*PASSPHRASE_PROMPT];
        if !one_shot && !target.has_credentials() {
            patterns.push(&*SHELL_PROMPT);
        }
        let wait = if one_shot {
            self.timeouts.connect()
        } else {
            self.timeouts.prompt_probe()
        };

        let mut password_sent = false;
        let mut passphrase_sent = false;
        loop {
            match self.expect(&patterns, wait).await {
                Expectation::Matched(0) => self.send_line("yes")?,
                Expectation::Matched(1) => {
                    let password = target.password.as_ref().ok_or_else(|| {
                        self.auth_error("a password was requested and none was provided")
                    })?;
                    if password_sent {
                        return Err(self.auth_error("password is incorrect"));
                    }
                    tokio::time::sleep(SECRET_ECHO_DELAY).await;
                    self.send_line(password.as_str())?;
                    password_sent = true;
                    if !one_shot && patterns.len() == 3 {
                        patterns.push(&*SHELL_PROMPT);
                    }
                }
                Expectation::Matched(2) => {
                    let passphrase = target.private_key_password.as_ref().ok_or_else(|| {
                        self.auth_error("a private key passphrase was requested and none was provided")
                    })?;
                    if passphrase_sent {
                        return Err(self.auth_error("private key passphrase is incorrect"));
                    }
                    tokio::time::sleep(SECRET_ECHO_DELAY).await;
                    self.send_line(passphrase.as_str())?;
                    passphrase_sent = true;
                    if !one_shot && patterns.len() == 3 {
                        patterns.push(&*SHELL_PROMPT);
                    }
                }
                Expectation::Matched(_) => return Ok(()),
                Expectation::Eof if one_shot => return Ok(()),
                Expectation::Eof => {
                    return Err(AkrunError::RefusedConnection {
                        host: self.host.clone(),
                    });
                }
                // no further prompt showed up, so assume the shell is waiting
                Expectation::Timeout if !one_shot => return Ok(()),
                Expectation::Timeout => {
                    return Err(AkrunError::ConnectionTimeout {
                        host: self.host.clone(),
                    });
                }
            }
        }
    }

    async fn prime_prompt(&mut self) -> Result<()> {
        let simple = uuid::Uuid::new_v4().simple().to_string();
        let marker = format!("akrun{}", &simple[..12]);
        self.send_line(&format!(
            " echo {START_SENTINEL}; export PS1='{marker} '; echo {END_SENTINEL}"
        ))?;
        self.send_line(" ")?;
        self.send_line(" ")?;

        let escaped = regex::escape(&marker);
        // three prompts after the end sentinel, so a prompt-like banner cannot fool us
        let handshake = Regex::new(&format!(
            r"(?s){END_SENTINEL}.+{escaped}.+{escaped}.+{escaped}"
        ))
        .map_err(|e| self.auth_error(&format!("cannot determine prompt: {e}")))?;
        match self.expect(&[&handshake], self.timeouts.connect()).await {
            Expectation::Matched(_) => {}
            Expectation::Eof => {
                return Err(AkrunError::RefusedConnection {
                    host: self.host.clone(),
                });
            }
            Expectation::Timeout => {
                return Err(AkrunError::ConnectionTimeout {
                    host: self.host.clone(),
                });
            }
        }
        self.prompt = Regex::new(&escaped)
            .map_err(|e| self.auth_error(&format!("cannot determine prompt: {e}")))?;

        tokio::time::sleep(PROMPT_SETTLE_DELAY).await;
        let echoed = self
            .run(&format!("echo {PROBE_TEXT}"), self.timeouts.command())
            .await?;
        if echoed.trim() != PROBE_TEXT {
            return Err(self.auth_error("cannot determine prompt"));
        }
        Ok(())
    }

    /// Run `command` and return the text printed between the sentinels.
    pub async fn run(&mut self, command: &str, timeout: Duration) -> Result<String> {
        self.flush_pending();
        debug!(host = %self.host, command, "remote command");
        self.send_line(&format!(" echo {START_SENTINEL}; {command}; echo {END_SENTINEL}"))?;
        self.wait_for_prompt(command, timeout).await?;
        Ok(clean_output(&extract_between_sentinels(&self.before)))
    }

    /// Run `command` without sentinels and return everything printed before the prompt.
    pub async fn run_no_return(&mut self, command: &str) -> Result<String> {
        self.flush_pending();
        debug!(host = %self.host, command, "remote command, raw");
        self.send_line(&format!(" {command}"))?;
        self.wait_for_prompt(command, self.timeouts.command()).await?;
        Ok(self.before.clone())
    }

    async fn wait_for_prompt(&mut self, command: &str, timeout: Duration) -> Result<()> {
        let prompt = self.prompt.clone();
        match self.expect(&[&prompt], timeout).await {
            Expectation::Matched(_) => Ok(()),
            Expectation::Timeout => Err(AkrunError::RemoteCommandTimeout {
                command: command.to_string(),
                after: timeout,
            }),
            Expectation::Eof => Err(AkrunError::RefusedConnection {
                host: self.host.clone(),
            }),
        }
    }

    /// Probe `path` by writing, reading back and deleting a sentinel file.
    pub async fn check_dir(&mut self, path: &str, create_if_missing: bool) -> Result<DirStatus> {
        let status = self.probe_dir(path).await?;
        if status == DirStatus::Missing && create_if_missing {
            info!(host = %self.host, path, "remote directory does not exist, creating it");
            self.run(&format!("mkdir -p {}", shell_quote(path)), self.timeouts.command())
                .await?;
            return self.probe_dir(path).await;
        }
        Ok(status)
    }

    /// Like [`check_dir`](Self::check_dir), but anything short of writable is an error.
    pub async fn ensure_dir(&mut self, path: &str, create_if_missing: bool) -> Result<()> {
        match self.check_dir(path, create_if_missing).await? {
            DirStatus::Writable => Ok(()),
            DirStatus::NotWritable => Err(AkrunError::DirectoryNotWritable {
                host: self.host.clone(),
                path: path.to_string(),
            }),
            DirStatus::Missing => Err(AkrunError::DirectoryNotFound {
                host: self.host.clone(),
                path: path.to_string(),
            }),
        }
    }

    async fn probe_dir(&mut self, path: &str) -> Result<DirStatus> {
        let timeout = self.timeouts.command();
        let quoted = shell_quote(path);
        let exists = self
            .run(
                &format!("test -d {quoted} && echo EXIST || echo DOES_NOT_EXIST"),
                timeout,
            )
            .await?;
        if exists.contains("DOES_NOT_EXIST") {
            return Ok(DirStatus::Missing);
        }

        let probe = shell_quote(&format!("{}/{TEST_WRITE_FILE}", path.trim_end_matches('/')));
        self.run(&format!("echo test > {probe}"), timeout).await?;
        let readback = self.run(&format!("cat {probe}"), timeout).await?;
        if readback.trim() != "test" {
            return Ok(DirStatus::NotWritable);
        }
        self.run(&format!("rm -f {probe}"), timeout).await?;
        Ok(DirStatus::Writable)
    }

    fn auth_error(&self, reason: &str) -> AkrunError {
        AkrunError::AuthError {
            host: self.host.clone(),
            reason: reason.to_string(),
        }
    }

    fn send_line(&mut self, text: &str) -> Result<()> {
        self.input.write_all(text.as_bytes())?;
        self.input.write_all(b"\n")?;
        self.input.flush()?;
        Ok(())
    }

    fn absorb(&mut self, chunk: &[u8]) {
        if let Some(transcript) = self.transcript.as_mut() {
            let _ = transcript.write_all(chunk);
        }
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
    }

    /// Discard output that arrived since the last match.
    fn flush_pending(&mut self) {
        loop {
            match self.output.try_recv() {
                Ok(chunk) => self.absorb(&chunk),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }
        self.buffer.clear();
    }

    async fn expect(&mut self, patterns: &[&Regex], timeout: Duration) -> Expectation {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some((idx, start, end)) = earliest_match(&self.buffer, patterns) {
                self.before = self.buffer[..start].to_string();
                self.buffer.drain(..end);
                return Expectation::Matched(idx);
            }
            if self.closed {
                self.before = std::mem::take(&mut self.buffer);
                return Expectation::Eof;
            }
            match tokio::time::timeout_at(deadline, self.output.recv()).await {
                Ok(Some(chunk)) => self.absorb(&chunk),
                Ok(None) => self.closed = true,
                Err(_) => {
                    self.before = self.buffer.clone();
                    return Expectation::Timeout;
                }
            }
        }
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        if let Some(process) = self.process.as_mut() {
            process.terminate();
        }
    }
}

/// First match across `patterns`; ties go to the earlier pattern.
fn earliest_match(text: &str, patterns: &[&Regex]) -> Option<(usize, usize, usize)> {
    patterns
        .iter()
        .enumerate()
        .filter_map(|(idx, re)| re.find(text).map(|m| (idx, m.start(), m.end())))
        .min_by_key(|(idx, start, _)| (*start, *idx))
}

/// Slice the text from the first newline after the last start sentinel up to
/// the last end sentinel.
pub fn extract_between_sentinels(text: &str) -> String {
    let from = text
        .rfind(START_SENTINEL)
        .and_then(|start| {
            text[start..]
                .find('\n')
                .map(|newline| start + newline + 1)
        })
        .unwrap_or(0);
    let to = text.rfind(END_SENTINEL).unwrap_or(text.len());
    if to <= from {
        return String::new();
    }
    strip_ansi(&text[from..to])
}

pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

fn clean_output(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "")
}

/// Quote `text` for a POSIX shell.
pub fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

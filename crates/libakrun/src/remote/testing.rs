//! Scripted stand-ins for a remote login, used by tests across the crate.
//!
//! [`FakeShell`] behaves like a terminal-backed login: it echoes typed lines,
//! asks for credentials, honours `export PS1=...` and hands command bodies to a
//! responder closure. [`FakeCluster`] is a responder with a tiny filesystem and
//! a Slurm-like queue.

use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use regex::Regex;
use tokio::sync::mpsc;

use super::{AccessTarget, Connector, END_SENTINEL, RemoteChannel, START_SENTINEL};
use crate::error::Result;

type Responder = Arc<dyn Fn(&str) -> String + Send + Sync>;

#[derive(Clone)]
pub struct FakeShell {
    host_key_prompt: bool,
    password: Option<String>,
    passphrase: Option<String>,
    motd: String,
    refuse: bool,
    silent: bool,
    stall_on: Option<String>,
    responder: Responder,
}

impl Default for FakeShell {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeShell {
    pub fn new() -> Self {
        Self {
            host_key_prompt: false,
            password: None,
            passphrase: None,
            motd: "Last login: Mon Jan  1 00:00:00 2024\r\n".to_string(),
            refuse: false,
            silent: false,
            stall_on: None,
            responder: Arc::new(|_| String::new()),
        }
    }

    pub fn with_host_key_prompt(mut self) -> Self {
        self.host_key_prompt = true;
        self
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    pub fn with_passphrase(mut self, passphrase: &str) -> Self {
        self.passphrase = Some(passphrase.to_string());
        self
    }

    pub fn with_motd(mut self, motd: &str) -> Self {
        self.motd = motd.to_string();
        self
    }

    pub fn refuse_connections(mut self) -> Self {
        self.refuse = true;
        self
    }

    /// Never print anything.
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    /// Commands containing `needle` never return.
    pub fn stall_on(mut self, needle: &str) -> Self {
        self.stall_on = Some(needle.to_string());
        self
    }

    pub fn respond_with<F>(mut self, responder: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.responder = Arc::new(responder);
        self
    }
}

/// Connector handing out [`FakeShell`] logins.
pub struct FakeConnector {
    shell: FakeShell,
    connections: AtomicUsize,
    commands: Arc<Mutex<Vec<String>>>,
}

impl FakeConnector {
    pub fn new(shell: FakeShell) -> Self {
        Self {
            shell,
            connections: AtomicUsize::new(0),
            commands: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Every command body that reached the responder, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl Connector for FakeConnector {
    fn connect(&self, _target: &AccessTarget, command: Option<&str>) -> Result<RemoteChannel> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut terminal = FakeTerminal {
            shell: self.shell.clone(),
            tx: Some(tx),
            stage: Stage::Connecting,
            line: Vec::new(),
            prompt: "[akrun@fake ~]$ ".to_string(),
            one_shot: command.map(str::to_string),
            commands: self.commands.clone(),
        };
        terminal.start();
        Ok(RemoteChannel {
            input: Box::new(terminal),
            output: rx,
            process: None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Connecting,
    HostKey,
    Passphrase,
    Password,
    Shell,
    Mute,
}

struct FakeTerminal {
    shell: FakeShell,
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    stage: Stage,
    line: Vec<u8>,
    prompt: String,
    one_shot: Option<String>,
    commands: Arc<Mutex<Vec<String>>>,
}

impl FakeTerminal {
    fn emit(&self, text: &str) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(text.as_bytes().to_vec());
        }
    }

    fn hang_up(&mut self) {
        self.tx = None;
        self.stage = Stage::Mute;
    }

    fn start(&mut self) {
        if self.shell.refuse {
            self.emit("ssh: connect to host fake port 22: Connection refused\r\n");
            self.hang_up();
        } else if self.shell.silent {
            self.stage = Stage::Mute;
        } else {
            self.advance();
        }
    }

    fn next_stage(&self) -> Stage {
        let order = [
            (Stage::HostKey, self.shell.host_key_prompt),
            (Stage::Passphrase, self.shell.passphrase.is_some()),
            (Stage::Password, self.shell.password.is_some()),
            (Stage::Shell, true),
        ];
        let position = order
            .iter()
            .position(|(stage, _)| *stage == self.stage)
            .map_or(0, |p| p + 1);
        order[position..]
            .iter()
            .find(|(_, enabled)| *enabled)
            .map_or(Stage::Shell, |(stage, _)| *stage)
    }

    fn advance(&mut self) {
        self.stage = self.next_stage();
        match self.stage {
            Stage::HostKey => self.emit(
                "The authenticity of host 'fake' can't be established.\r\n\
                 Are you sure you want to continue connecting (yes/no)? ",
            ),
            Stage::Passphrase => self.emit("Enter passphrase for key '/home/akrun/.ssh/id_rsa': "),
            Stage::Password => self.emit("akrun@fake's password: "),
            Stage::Shell => {
                if let Some(command) = self.one_shot.take() {
                    let body = command
                        .strip_prefix(&format!("echo {START_SENTINEL};"))
                        .and_then(|rest| rest.strip_suffix(&format!(";echo {END_SENTINEL}")))
                        .unwrap_or(command.as_str())
                        .to_string();
                    let output = crlf(&self.respond(&body));
                    self.emit(&format!("{START_SENTINEL}\r\n{output}{END_SENTINEL}\r\n"));
                    self.hang_up();
                } else {
                    self.emit(&self.shell.motd.clone());
                    self.emit(&self.prompt.clone());
                }
            }
            Stage::Connecting | Stage::Mute => {}
        }
    }

    fn on_line(&mut self, line: &str) {
        match self.stage {
            Stage::HostKey => {
                if line.trim() == "yes" {
                    self.emit("\r\nWarning: Permanently added 'fake' to the list of known hosts.\r\n");
                    self.advance();
                } else {
                    self.emit("Host key verification failed.\r\n");
                    self.hang_up();
                }
            }
            Stage::Passphrase => {
                if Some(line) == self.shell.passphrase.as_deref() {
                    self.emit("\r\n");
                    self.advance();
                } else {
                    self.emit("\r\nEnter passphrase for key '/home/akrun/.ssh/id_rsa': ");
                }
            }
            Stage::Password => {
                if Some(line) == self.shell.password.as_deref() {
                    self.emit("\r\n");
                    self.advance();
                } else {
                    self.emit("\r\nPermission denied, please try again.\r\nakrun@fake's password: ");
                }
            }
            Stage::Shell => {
                self.emit(&format!("{line}\r\n"));
                self.execute(line);
            }
            Stage::Connecting | Stage::Mute => {}
        }
    }

    fn execute(&mut self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            self.emit(&self.prompt.clone());
            return;
        }
        if self.stalls(trimmed) {
            return;
        }

        let start = format!("echo {START_SENTINEL};");
        let end = format!("; echo {END_SENTINEL}");
        let Some(body) = trimmed
            .strip_prefix(&start)
            .and_then(|rest| rest.strip_suffix(&end))
            .map(str::trim)
        else {
            let output = crlf(&self.respond(trimmed));
            self.emit(&output);
            self.emit(&self.prompt.clone());
            return;
        };

        let output = match parse_ps1(body) {
            Some(prompt) => {
                self.prompt = prompt;
                String::new()
            }
            None => crlf(&self.respond(body)),
        };
        self.emit(&format!("{START_SENTINEL}\r\n{output}{END_SENTINEL}\r\n"));
        self.emit(&self.prompt.clone());
    }

    fn stalls(&self, command: &str) -> bool {
        self.shell
            .stall_on
            .as_deref()
            .is_some_and(|needle| command.contains(needle))
    }

    fn respond(&self, body: &str) -> String {
        if let Ok(mut seen) = self.commands.lock() {
            seen.push(body.to_string());
        }
        match body.strip_prefix("echo ") {
            Some(text) if !text.contains([';', '&', '|', '>', '$']) => {
                format!("{}\n", text.trim().trim_matches('\''))
            }
            _ => (self.shell.responder)(body),
        }
    }
}

impl Write for FakeTerminal {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for byte in buf {
            if *byte == b'\n' {
                let line = String::from_utf8_lossy(&self.line)
                    .trim_end_matches('\r')
                    .to_string();
                self.line.clear();
                self.on_line(&line);
            } else {
                self.line.push(*byte);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn parse_ps1(body: &str) -> Option<String> {
    body.strip_prefix("export PS1='")
        .and_then(|rest| rest.strip_suffix('\''))
        .map(str::to_string)
}

fn crlf(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let mut text = text.replace("\r\n", "\n");
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text.replace('\n', "\r\n")
}

#[derive(Default)]
struct ClusterState {
    dirs: HashSet<String>,
    read_only: HashSet<String>,
    files: HashMap<String, String>,
    jobs: HashMap<String, FakeJob>,
    next_job: u64,
    submissions: usize,
    reject_reason: Option<String>,
    exit_status: i32,
    queued_polls: u32,
    running_polls: u32,
}

struct FakeJob {
    dir: String,
    polls: u32,
}

static TEST_DIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^test -d '([^']*)' && echo EXIST \|\| echo DOES_NOT_EXIST$").expect("pattern")
});
static MKDIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^mkdir -p '([^']*)'$").expect("pattern"));
static ECHO_TEST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^echo test > '([^']*)'$").expect("pattern"));
static CAT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^cat '([^']*)'( 2>/dev/null)?$").expect("pattern"));
static RM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^rm -f '([^']*)'$").expect("pattern"));
static PRINTF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^printf '%s' '([^']*)' (>>?) '([^']*)'$").expect("pattern")
});
static DECODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^base64 -d '([^']*)' > '([^']*)' && rm -f '([^']*)'$").expect("pattern")
});
static SBATCH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^cd '([^']*)' && sbatch job\.sh > job\.id 2>&1; cat '([^']*)'$").expect("pattern")
});
static SQUEUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^squeue -h -j (\S+) -o %T").expect("pattern"));

/// Responder emulating a login node with a Slurm queue.
///
/// Jobs report `PENDING`, then `RUNNING`, then vanish from the queue; when a
/// job leaves the queue every directory under its submit directory receives a
/// `stdout` ending with the configured exit status trailer.
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        let cluster = Self::default();
        cluster.with_state(|s| {
            s.next_job = 1000;
            s.queued_polls = 1;
            s.running_polls = 1;
        });
        cluster
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ClusterState) -> T) -> T {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    pub fn with_dir(self, path: &str) -> Self {
        self.with_state(|s| add_dir(s, path));
        self
    }

    pub fn with_read_only_dir(self, path: &str) -> Self {
        self.with_state(|s| {
            add_dir(s, path);
            s.read_only.insert(path.to_string());
        });
        self
    }

    pub fn rejecting_submissions(self, reason: &str) -> Self {
        self.with_state(|s| s.reject_reason = Some(reason.to_string()));
        self
    }

    pub fn with_exit_status(self, status: i32) -> Self {
        self.with_state(|s| s.exit_status = status);
        self
    }

    pub fn submissions(&self) -> usize {
        self.with_state(|s| s.submissions)
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.with_state(|s| s.files.get(path).cloned())
    }

    pub fn put_file(&self, path: &str, content: &str) {
        self.with_state(|s| {
            s.files.insert(path.to_string(), content.to_string());
        });
    }

    pub fn shell(&self) -> FakeShell {
        let cluster = self.clone();
        FakeShell::new().respond_with(move |command| cluster.handle(command))
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector::new(self.shell())
    }

    fn handle(&self, command: &str) -> String {
        self.with_state(|s| handle_command(s, command))
    }
}

fn add_dir(state: &mut ClusterState, path: &str) {
    let mut current = String::new();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        current.push('/');
        current.push_str(part);
        state.dirs.insert(current.clone());
    }
}

fn parent(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(dir, _)| dir)
}

fn handle_command(s: &mut ClusterState, command: &str) -> String {
    if let Some(c) = TEST_DIR.captures(command) {
        return if s.dirs.contains(&c[1]) {
            "EXIST\n".into()
        } else {
            "DOES_NOT_EXIST\n".into()
        };
    }
    if let Some(c) = MKDIR.captures(command) {
        add_dir(s, &c[1]);
        return String::new();
    }
    if let Some(c) = ECHO_TEST.captures(command) {
        let dir = parent(&c[1]);
        if s.read_only.contains(dir) || !s.dirs.contains(dir) {
            return format!("bash: {}: Permission denied\n", &c[1]);
        }
        s.files.insert(c[1].to_string(), "test\n".into());
        return String::new();
    }
    if let Some(c) = CAT.captures(command) {
        return match s.files.get(&c[1]) {
            Some(content) => content.clone(),
            None if c.get(2).is_some() => String::new(),
            None => format!("cat: {}: No such file or directory\n", &c[1]),
        };
    }
    if let Some(c) = RM.captures(command) {
        s.files.remove(&c[1]);
        return String::new();
    }
    if let Some(c) = PRINTF.captures(command) {
        let entry = s.files.entry(c[3].to_string()).or_default();
        if &c[2] == ">" {
            entry.clear();
        }
        entry.push_str(&c[1]);
        return String::new();
    }
    if let Some(c) = DECODE.captures(command) {
        let encoded = s.files.get(&c[1]).cloned().unwrap_or_default();
        return match BASE64.decode(encoded.trim()) {
            Ok(bytes) => {
                s.files
                    .insert(c[2].to_string(), String::from_utf8_lossy(&bytes).into_owned());
                s.files.remove(&c[3]);
                String::new()
            }
            Err(e) => format!("base64: invalid input: {e}\n"),
        };
    }
    if let Some(c) = SBATCH.captures(command) {
        let dir = c[1].to_string();
        let answer = match &s.reject_reason {
            Some(reason) => format!("sbatch: error: Batch job submission failed: {reason}\n"),
            None => {
                s.next_job += 1;
                s.submissions += 1;
                let id = s.next_job.to_string();
                s.jobs.insert(
                    id.clone(),
                    FakeJob {
                        dir: dir.clone(),
                        polls: 0,
                    },
                );
                format!("Submitted batch job {id}\n")
            }
        };
        s.files.insert(format!("{dir}/job.id"), answer.clone());
        return answer;
    }
    if let Some(c) = SQUEUE.captures(command) {
        let (queued, running, exit_status) = (s.queued_polls, s.running_polls, s.exit_status);
        let Some(job) = s.jobs.get_mut(&c[1]) else {
            return String::new();
        };
        job.polls += 1;
        if job.polls <= queued {
            return "PENDING\n".into();
        }
        if job.polls <= queued + running {
            return "RUNNING\n".into();
        }
        if job.polls == queued + running + 1 {
            let root = job.dir.clone();
            let prefix = format!("{root}/");
            let outputs: Vec<String> = s
                .dirs
                .iter()
                .filter(|d| **d == root || d.starts_with(&prefix))
                .cloned()
                .collect();
            for dir in outputs {
                s.files.insert(
                    format!("{dir}/stdout"),
                    format!("benchmark output\nakrun:exit_status={exit_status}\n"),
                );
                s.files.insert(format!("{dir}/stderr"), String::new());
            }
        }
        return String::new();
    }
    format!("bash: {command}: command not found\n")
}

//! Per-task redirection of the daemon's log output.
//!
//! While a task step runs, formatted log lines and the remote session
//! transcript go to the task's `proc/log` instead of stderr. Redirections do
//! not nest.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Local;
use tracing_subscriber::fmt::MakeWriter;

use crate::error::{AkrunError, Result};

struct Redirected {
    file: File,
    path: PathBuf,
}

/// Process-scoped log redirector; clones share one target.
#[derive(Clone, Default)]
pub struct LogRedirect {
    target: Arc<Mutex<Option<Redirected>>>,
}

impl LogRedirect {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Redirected>> {
        self.target
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start appending to `path`, framed by an opening banner.
    pub fn redirect(&self, path: &Path) -> Result<()> {
        let mut target = self.lock();
        if target.is_some() {
            return Err(AkrunError::AlreadyRedirected);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, ">>> {} {}", Local::now().format("%Y-%m-%d %H:%M:%S"), ">".repeat(60))?;
        *target = Some(Redirected {
            file,
            path: path.to_path_buf(),
        });
        Ok(())
    }

    /// Close the current log with a trailing banner and go back to stderr.
    pub fn restore(&self) -> Result<PathBuf> {
        let mut redirected = self.lock().take().ok_or(AkrunError::NotRedirected)?;
        writeln!(
            redirected.file,
            "<<< {} {}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            "<".repeat(60)
        )?;
        redirected.file.flush()?;
        Ok(redirected.path)
    }

    /// Writer for raw session output; dropped when nothing is redirected.
    pub fn transcript(&self) -> RedirectWriter {
        RedirectWriter {
            target: self.target.clone(),
            stderr_fallback: false,
        }
    }
}

impl<'a> MakeWriter<'a> for LogRedirect {
    type Writer = RedirectWriter;

    fn make_writer(&'a self) -> Self::Writer {
        RedirectWriter {
            target: self.target.clone(),
            stderr_fallback: true,
        }
    }
}

pub struct RedirectWriter {
    target: Arc<Mutex<Option<Redirected>>>,
    stderr_fallback: bool,
}

impl Write for RedirectWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut target = self
            .target
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match target.as_mut() {
            Some(redirected) => redirected.file.write(buf),
            None if self.stderr_fallback => io::stderr().write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut target = self
            .target
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match target.as_mut() {
            Some(redirected) => redirected.file.flush(),
            None if self.stderr_fallback => io::stderr().flush(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_refuses_to_nest() {
        let dir = tempfile::tempdir().unwrap();
        let redirect = LogRedirect::new();
        redirect.redirect(&dir.path().join("a/log")).unwrap();
        assert!(matches!(
            redirect.redirect(&dir.path().join("b/log")),
            Err(AkrunError::AlreadyRedirected)
        ));
        redirect.restore().unwrap();
        assert!(matches!(redirect.restore(), Err(AkrunError::NotRedirected)));
    }

    #[test]
    fn output_is_framed_by_banners() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proc/log");
        let redirect = LogRedirect::new();

        redirect.redirect(&path).unwrap();
        redirect.make_writer().write_all(b"step output\n").unwrap();
        redirect.transcript().write_all(b"$ squeue\n").unwrap();
        assert_eq!(redirect.restore().unwrap(), path);

        // nothing is redirected now, so the transcript is dropped
        redirect.transcript().write_all(b"lost\n").unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with(">>> "));
        assert_eq!(lines[1], "step output");
        assert_eq!(lines[2], "$ squeue");
        assert!(lines[3].starts_with("<<< "));
        assert!(!text.contains("lost"));
    }
}

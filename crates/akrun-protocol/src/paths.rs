//! Default file locations shared by the daemon and the CLI.
//!
//! Runtime files (socket, pid) live under `$XDG_RUNTIME_DIR/akrun`, the
//! config file under `$XDG_CONFIG_HOME/akrun`, and task state (the database
//! plus the active and completed task trees) under `$XDG_DATA_HOME/akrun`.
//! Every setting here can be overridden in the server config.

use std::ffi::OsString;
use std::path::PathBuf;

const APP: &str = "akrun";

/// Resolved default locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locations {
    pub runtime_dir: PathBuf,
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl Locations {
    /// Resolve against the process environment.
    pub fn from_env() -> Self {
        // SAFETY: getuid() is always safe to call and has no preconditions
        let uid = unsafe { libc::getuid() };
        Self::resolve(|var| std::env::var_os(var), uid)
    }

    /// Resolve with `env` standing in for the environment.
    pub fn resolve(env: impl Fn(&str) -> Option<OsString>, uid: u32) -> Self {
        let var = |name: &str| env(name).filter(|value| !value.is_empty()).map(PathBuf::from);
        let home = var("HOME");
        let under_home = |parts: &[&str]| {
            home.as_ref()
                .map(|home| parts.iter().fold(home.clone(), |path, part| path.join(part)))
        };
        let scratch = PathBuf::from(format!("/tmp/{APP}-{uid}"));

        let runtime_dir = var("XDG_RUNTIME_DIR")
            .map(|dir| dir.join(APP))
            .unwrap_or_else(|| scratch.clone());
        let config_dir = var("XDG_CONFIG_HOME")
            .or_else(|| under_home(&[".config"]))
            .map(|dir| dir.join(APP))
            .unwrap_or_else(|| scratch.join("config"));
        let data_dir = var("XDG_DATA_HOME")
            .or_else(|| under_home(&[".local", "share"]))
            .map(|dir| dir.join(APP))
            .unwrap_or_else(|| scratch.join("data"));
        Self {
            runtime_dir,
            config_dir,
            data_dir,
        }
    }

    pub fn socket_path(&self) -> PathBuf {
        self.runtime_dir.join("akrun.sock")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.runtime_dir.join("akrun.pid")
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("akrun.db")
    }

    /// Root of the directories of running tasks.
    pub fn active_tasks_dir(&self) -> PathBuf {
        self.data_dir.join("tasks")
    }

    /// Root finished task directories are moved into.
    pub fn completed_tasks_dir(&self) -> PathBuf {
        self.data_dir.join("completed")
    }
}

pub fn default_socket_path() -> PathBuf {
    Locations::from_env().socket_path()
}

pub fn pid_file_path() -> PathBuf {
    Locations::from_env().pid_file()
}

pub fn config_path() -> PathBuf {
    Locations::from_env().config_file()
}

pub fn db_path() -> PathBuf {
    Locations::from_env().db_path()
}

pub fn active_tasks_dir() -> PathBuf {
    Locations::from_env().active_tasks_dir()
}

pub fn completed_tasks_dir() -> PathBuf {
    Locations::from_env().completed_tasks_dir()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolve(vars: &[(&str, &str)]) -> Locations {
        let vars: HashMap<String, OsString> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), OsString::from(value)))
            .collect();
        Locations::resolve(|name| vars.get(name).cloned(), 1000)
    }

    #[test]
    fn xdg_directories_win() {
        let locations = resolve(&[
            ("HOME", "/home/bench"),
            ("XDG_RUNTIME_DIR", "/run/user/1000"),
            ("XDG_CONFIG_HOME", "/etc/xdg"),
            ("XDG_DATA_HOME", "/srv/state"),
        ]);
        assert_eq!(locations.socket_path(), PathBuf::from("/run/user/1000/akrun/akrun.sock"));
        assert_eq!(locations.pid_file(), PathBuf::from("/run/user/1000/akrun/akrun.pid"));
        assert_eq!(locations.config_file(), PathBuf::from("/etc/xdg/akrun/config.toml"));
        assert_eq!(locations.db_path(), PathBuf::from("/srv/state/akrun/akrun.db"));
        assert_eq!(locations.completed_tasks_dir(), PathBuf::from("/srv/state/akrun/completed"));
    }

    #[test]
    fn home_fallbacks() {
        let locations = resolve(&[("HOME", "/home/bench"), ("XDG_DATA_HOME", "")]);
        assert_eq!(locations.runtime_dir, PathBuf::from("/tmp/akrun-1000"));
        assert_eq!(locations.config_dir, PathBuf::from("/home/bench/.config/akrun"));
        assert_eq!(
            locations.active_tasks_dir(),
            PathBuf::from("/home/bench/.local/share/akrun/tasks")
        );
    }

    #[test]
    fn bare_environment_stays_under_one_scratch_dir() {
        let locations = resolve(&[]);
        for dir in [&locations.runtime_dir, &locations.config_dir, &locations.data_dir] {
            assert!(dir.starts_with("/tmp/akrun-1000"), "{}", dir.display());
        }
    }
}

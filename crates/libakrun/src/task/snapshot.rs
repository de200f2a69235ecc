//! Versioned, append-only snapshot files.
//!
//! A snapshot lives at `<proc_dir>/<version:06d>.snapshot`. Files are never
//! overwritten, and readers always take the numerically highest version.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{AkrunError, Result};

const EXTENSION: &str = "snapshot";

pub fn snapshot_path(proc_dir: &Path, version: u32) -> PathBuf {
    proc_dir.join(format!("{version:06}.{EXTENSION}"))
}

fn parse_version(path: &Path) -> Option<u32> {
    if path.extension()? != EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.len() < 6 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Write `value` as snapshot `version`, refusing to replace an existing one.
pub fn write_snapshot<T: Serialize>(proc_dir: &Path, version: u32, value: &T) -> Result<PathBuf> {
    fs::create_dir_all(proc_dir)?;
    let target = snapshot_path(proc_dir, version);
    let staging = proc_dir.join(format!(".{version:06}.{EXTENSION}.tmp"));

    let mut file = fs::File::create(&staging)?;
    serde_json::to_writer_pretty(&mut file, value)?;
    file.write_all(b"\n")?;
    file.sync_all()?;
    drop(file);

    // hard_link fails instead of clobbering an existing version
    let linked = fs::hard_link(&staging, &target);
    let _ = fs::remove_file(&staging);
    linked?;
    Ok(target)
}

/// Highest snapshot version present in `proc_dir`.
pub fn latest_version(proc_dir: &Path) -> Result<u32> {
    let entries = match fs::read_dir(proc_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AkrunError::SnapshotNotFound(proc_dir.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };
    let mut latest = None;
    for entry in entries {
        if let Some(version) = parse_version(&entry?.path()) {
            latest = latest.max(Some(version));
        }
    }
    latest.ok_or_else(|| AkrunError::SnapshotNotFound(proc_dir.to_path_buf()))
}

pub fn read_latest<T: DeserializeOwned>(proc_dir: &Path) -> Result<(u32, T)> {
    let version = latest_version(proc_dir)?;
    let raw = fs::read(snapshot_path(proc_dir, version))?;
    Ok((version, serde_json::from_slice(&raw)?))
}

/// Remove every snapshot file, leaving other files in `proc_dir` alone.
pub fn prune(proc_dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(proc_dir)? {
        let path = entry?.path();
        if parse_version(&path).is_some() {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct State {
        step: u32,
    }

    #[test]
    fn highest_version_wins_regardless_of_write_order() {
        let dir = tempfile::tempdir().unwrap();
        for version in [3, 1, 12, 7] {
            write_snapshot(dir.path(), version, &State { step: version }).unwrap();
        }
        let (version, state): (u32, State) = read_latest(dir.path()).unwrap();
        assert_eq!(version, 12);
        assert_eq!(state, State { step: 12 });
    }

    #[test]
    fn existing_versions_are_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        write_snapshot(dir.path(), 1, &State { step: 1 }).unwrap();
        assert!(write_snapshot(dir.path(), 1, &State { step: 99 }).is_err());
        let (_, state): (u32, State) = read_latest(dir.path()).unwrap();
        assert_eq!(state.step, 1);
        assert!(!dir.path().join(".000001.snapshot.tmp").exists());
    }

    #[test]
    fn missing_snapshots_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("log"), "x").unwrap();
        fs::write(dir.path().join("notes.snapshot"), "x").unwrap();
        assert!(matches!(
            latest_version(dir.path()),
            Err(AkrunError::SnapshotNotFound(_))
        ));
        assert!(matches!(
            latest_version(&dir.path().join("absent")),
            Err(AkrunError::SnapshotNotFound(_))
        ));
    }

    #[test]
    fn prune_keeps_the_log() {
        let dir = tempfile::tempdir().unwrap();
        write_snapshot(dir.path(), 1, &State { step: 1 }).unwrap();
        write_snapshot(dir.path(), 2, &State { step: 2 }).unwrap();
        fs::write(dir.path().join("log"), "kept").unwrap();
        assert_eq!(prune(dir.path()).unwrap(), 2);
        assert!(dir.path().join("log").exists());
    }
}

//! SQLite-backed task store: scheduled, active and completed task rows.
//!
//! A task row lives in exactly one of the three tables; moving between them
//! happens inside one transaction. Writers of an active row take the advisory
//! `task_lock` first and only write while they hold it.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use akrun_protocol::{TaskId, TaskLocation, TaskRecord, TaskStatus};
use chrono::NaiveDateTime;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::error::{AkrunError, Result};
use crate::recurrence::{TIME_FORMAT, format_time};
use crate::task::TaskParams;

/// Lock value written by the scheduling daemon while it steps a task.
pub const DAEMON_LOCK: i64 = 1;
/// Lock value written by the front-end for its direct edits.
pub const FRONTEND_LOCK: i64 = 2;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS task_id_seq (
    id INTEGER PRIMARY KEY AUTOINCREMENT
);
CREATE TABLE IF NOT EXISTS scheduled_tasks (
    task_id         INTEGER PRIMARY KEY NOT NULL,
    resource        TEXT NOT NULL,
    app             TEXT NOT NULL,
    time_to_start   TEXT NOT NULL,
    repeat_in       TEXT,
    resource_param  TEXT NOT NULL DEFAULT '{}',
    app_param       TEXT NOT NULL DEFAULT '{}',
    task_param      TEXT NOT NULL DEFAULT '{}',
    parent_id       INTEGER,
    group_id        TEXT
);
CREATE INDEX IF NOT EXISTS idx_scheduled_start ON scheduled_tasks(time_to_start);
CREATE TABLE IF NOT EXISTS active_tasks (
    task_id             INTEGER PRIMARY KEY NOT NULL,
    resource            TEXT NOT NULL,
    app                 TEXT NOT NULL,
    time_to_start       TEXT NOT NULL,
    repeat_in           TEXT,
    resource_param      TEXT NOT NULL DEFAULT '{}',
    app_param           TEXT NOT NULL DEFAULT '{}',
    task_param          TEXT NOT NULL DEFAULT '{}',
    parent_id           INTEGER,
    group_id            TEXT,
    time_stamp          TEXT NOT NULL,
    task_dir            TEXT NOT NULL,
    status              TEXT NOT NULL,
    status_info         TEXT NOT NULL DEFAULT '',
    next_check_time     TEXT NOT NULL,
    task_lock           INTEGER NOT NULL DEFAULT 0,
    last_pickled_state  INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS completed_tasks (
    task_id         INTEGER PRIMARY KEY NOT NULL,
    resource        TEXT NOT NULL,
    app             TEXT NOT NULL,
    time_to_start   TEXT NOT NULL,
    repeat_in       TEXT,
    resource_param  TEXT NOT NULL DEFAULT '{}',
    app_param       TEXT NOT NULL DEFAULT '{}',
    task_param      TEXT NOT NULL DEFAULT '{}',
    parent_id       INTEGER,
    group_id        TEXT,
    time_stamp      TEXT NOT NULL,
    task_dir        TEXT NOT NULL,
    status          TEXT NOT NULL,
    status_info     TEXT NOT NULL DEFAULT '',
    finished_at     TEXT NOT NULL
);";

const TASK_COLUMNS: &str = "task_id, resource, app, time_to_start, repeat_in, \
    resource_param, app_param, task_param, parent_id, group_id";

/// Fields of a task to be scheduled; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub resource: String,
    pub app: String,
    pub time_to_start: NaiveDateTime,
    pub repeat_in: Option<String>,
    pub params: TaskParams,
    pub parent_id: Option<TaskId>,
    pub group_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledTask {
    pub task_id: TaskId,
    pub resource: String,
    pub app: String,
    pub time_to_start: NaiveDateTime,
    pub repeat_in: Option<String>,
    pub params: TaskParams,
    pub parent_id: Option<TaskId>,
    pub group_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActiveTask {
    pub task: ScheduledTask,
    pub time_stamp: String,
    pub task_dir: PathBuf,
    pub status: TaskStatus,
    pub status_info: String,
    pub next_check_time: NaiveDateTime,
    pub task_lock: i64,
    pub last_pickled_state: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletedTask {
    pub task: ScheduledTask,
    pub time_stamp: String,
    pub task_dir: PathBuf,
    pub status: TaskStatus,
    pub status_info: String,
    pub finished_at: NaiveDateTime,
}

/// Runtime columns written when a scheduled task becomes active or is stepped.
#[derive(Debug, Clone)]
pub struct Progress {
    pub status: TaskStatus,
    pub status_info: String,
    pub next_check_time: NaiveDateTime,
    pub version: u32,
}

pub struct TaskStore {
    conn: Mutex<Connection>,
}

impl TaskStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        let active: i64 = conn.query_row("SELECT COUNT(*) FROM active_tasks", [], |row| row.get(0))?;
        if active > 0 {
            tracing::info!(active, "task store opened with active tasks");
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_scheduled(&self, new: &NewTask) -> Result<TaskId> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let task_id = insert_scheduled_in(&tx, new)?;
        tx.commit()?;
        Ok(task_id)
    }

    pub fn scheduled(&self, task_id: TaskId) -> Result<Option<ScheduledTask>> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE task_id = ?1"),
                [task_id],
                scheduled_from_row,
            )
            .optional()?)
    }

    /// Scheduled tasks whose start time has passed, oldest first.
    pub fn due_scheduled(&self, now: NaiveDateTime) -> Result<Vec<ScheduledTask>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM scheduled_tasks
             WHERE time_to_start <= ?1 ORDER BY time_to_start, task_id"
        ))?;
        let rows = stmt.query_map([format_time(now)], scheduled_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn update_scheduled(&self, task: &ScheduledTask) -> Result<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE scheduled_tasks SET time_to_start = ?2, repeat_in = ?3, resource_param = ?4,
                 app_param = ?5, task_param = ?6, group_id = ?7
             WHERE task_id = ?1",
            params![
                task.task_id,
                format_time(task.time_to_start),
                task.repeat_in,
                json_text(&task.params.resource_param)?,
                json_text(&task.params.app_param)?,
                json_text(&task.params.task_param)?,
                task.group_id,
            ],
        )?;
        Ok(changed == 1)
    }

    pub fn delete_scheduled(&self, task_id: TaskId) -> Result<bool> {
        let conn = self.conn();
        Ok(conn.execute("DELETE FROM scheduled_tasks WHERE task_id = ?1", [task_id])? == 1)
    }

    /// Scheduled tasks spawned by `parent_id`.
    pub fn scheduled_children(&self, parent_id: TaskId) -> Result<Vec<TaskId>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT task_id FROM scheduled_tasks WHERE parent_id = ?1 ORDER BY task_id")?;
        let rows = stmt.query_map([parent_id], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Move a scheduled row into the active table.
    pub fn promote(
        &self,
        task: &ScheduledTask,
        time_stamp: &str,
        task_dir: &Path,
        progress: &Progress,
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM scheduled_tasks WHERE task_id = ?1", [task.task_id])?;
        if removed != 1 {
            return Err(AkrunError::TaskNotFound(task.task_id));
        }
        tx.execute(
            &format!(
                "INSERT INTO active_tasks ({TASK_COLUMNS}, time_stamp, task_dir, status, status_info,
                     next_check_time, task_lock, last_pickled_state)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, 0, ?16)"
            ),
            params![
                task.task_id,
                task.resource,
                task.app,
                format_time(task.time_to_start),
                task.repeat_in,
                json_text(&task.params.resource_param)?,
                json_text(&task.params.app_param)?,
                json_text(&task.params.task_param)?,
                task.parent_id,
                task.group_id,
                time_stamp,
                task_dir.to_string_lossy(),
                progress.status.as_str(),
                progress.status_info,
                format_time(progress.next_check_time),
                progress.version,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn active(&self, task_id: TaskId) -> Result<Option<ActiveTask>> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {TASK_COLUMNS}, time_stamp, task_dir, status, status_info,
                         next_check_time, task_lock, last_pickled_state
                     FROM active_tasks WHERE task_id = ?1"
                ),
                [task_id],
                active_from_row,
            )
            .optional()?)
    }

    /// Active tasks whose next check is due, most overdue first.
    pub fn due_active(&self, now: NaiveDateTime) -> Result<Vec<TaskId>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT task_id FROM active_tasks
             WHERE next_check_time <= ?1 ORDER BY next_check_time, task_id",
        )?;
        let rows = stmt.query_map([format_time(now)], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Take the advisory lock if it is free. Never waits.
    pub fn try_lock_active(&self, task_id: TaskId, token: i64) -> Result<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE active_tasks SET task_lock = ?2 WHERE task_id = ?1 AND task_lock = 0",
            params![task_id, token],
        )?;
        Ok(changed == 1)
    }

    pub fn unlock_active(&self, task_id: TaskId, token: i64) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE active_tasks SET task_lock = 0 WHERE task_id = ?1 AND task_lock = ?2",
            params![task_id, token],
        )?;
        Ok(())
    }

    /// Release every advisory lock; only valid while no writer is running.
    pub fn clear_locks(&self) -> Result<usize> {
        let conn = self.conn();
        Ok(conn.execute("UPDATE active_tasks SET task_lock = 0 WHERE task_lock != 0", [])?)
    }

    /// Poll until the advisory lock is free, then take it.
    ///
    /// Fails with `StaleLock` once `max_wait` passes without the lock clearing.
    pub async fn lock_active_when_free(
        &self,
        task_id: TaskId,
        token: i64,
        poll: Duration,
        max_wait: Duration,
    ) -> Result<()> {
        let started = Instant::now();
        loop {
            if self.try_lock_active(task_id, token)? {
                return Ok(());
            }
            if self.active(task_id)?.is_none() {
                return Err(AkrunError::TaskNotFound(task_id));
            }
            let waited = started.elapsed();
            if waited >= max_wait {
                return Err(AkrunError::StaleLock { task_id, waited });
            }
            tracing::debug!(task_id, ?waited, "active task is locked, waiting");
            tokio::time::sleep(poll).await;
        }
    }

    /// Write step results; only applies while `token` holds the lock.
    pub fn record_progress(&self, task_id: TaskId, token: i64, progress: &Progress) -> Result<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE active_tasks SET status = ?3, status_info = ?4, next_check_time = ?5,
                 last_pickled_state = ?6
             WHERE task_id = ?1 AND task_lock = ?2",
            params![
                task_id,
                token,
                progress.status.as_str(),
                progress.status_info,
                format_time(progress.next_check_time),
                progress.version,
            ],
        )?;
        Ok(changed == 1)
    }

    /// Push back the next check and note why; only applies while `token` holds the lock.
    pub fn defer_active(
        &self,
        task_id: TaskId,
        token: i64,
        status_info: &str,
        next_check_time: NaiveDateTime,
    ) -> Result<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE active_tasks SET status_info = ?3, next_check_time = ?4
             WHERE task_id = ?1 AND task_lock = ?2",
            params![task_id, token, status_info, format_time(next_check_time)],
        )?;
        Ok(changed == 1)
    }

    /// Rewrite the editable columns of an active row; only applies while `token` holds the lock.
    pub fn update_active(
        &self,
        task_id: TaskId,
        token: i64,
        task: &ScheduledTask,
        next_check_time: NaiveDateTime,
    ) -> Result<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE active_tasks SET repeat_in = ?3, resource_param = ?4, app_param = ?5,
                 task_param = ?6, group_id = ?7, next_check_time = ?8
             WHERE task_id = ?1 AND task_lock = ?2",
            params![
                task_id,
                token,
                task.repeat_in,
                json_text(&task.params.resource_param)?,
                json_text(&task.params.app_param)?,
                json_text(&task.params.task_param)?,
                task.group_id,
                format_time(next_check_time),
            ],
        )?;
        Ok(changed == 1)
    }

    pub fn delete_active(&self, task_id: TaskId) -> Result<bool> {
        let conn = self.conn();
        Ok(conn.execute("DELETE FROM active_tasks WHERE task_id = ?1", [task_id])? == 1)
    }

    /// Move an active row into the completed table and, for a recurring
    /// task, schedule its next run in the same transaction.
    ///
    /// Returns the id of the scheduled child, if any.
    pub fn complete(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        status_info: &str,
        task_dir: &Path,
        finished_at: NaiveDateTime,
        next_run: Option<&NewTask>,
    ) -> Result<Option<TaskId>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let copied = tx.execute(
            &format!(
                "INSERT INTO completed_tasks ({TASK_COLUMNS}, time_stamp, task_dir, status,
                     status_info, finished_at)
                 SELECT {TASK_COLUMNS}, time_stamp, ?2, ?3, ?4, ?5
                 FROM active_tasks WHERE task_id = ?1"
            ),
            params![
                task_id,
                task_dir.to_string_lossy(),
                status.as_str(),
                status_info,
                format_time(finished_at),
            ],
        )?;
        if copied != 1 {
            return Err(AkrunError::TaskNotFound(task_id));
        }
        tx.execute("DELETE FROM active_tasks WHERE task_id = ?1", [task_id])?;
        let child = next_run.map(|next| insert_scheduled_in(&tx, next)).transpose()?;
        tx.commit()?;
        Ok(child)
    }

    pub fn completed(&self, task_id: TaskId) -> Result<Option<CompletedTask>> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {TASK_COLUMNS}, time_stamp, task_dir, status, status_info, finished_at
                     FROM completed_tasks WHERE task_id = ?1"
                ),
                [task_id],
                completed_from_row,
            )
            .optional()?)
    }

    /// Look a task up in whichever table holds it.
    pub fn get(&self, task_id: TaskId) -> Result<Option<TaskRecord>> {
        if let Some(task) = self.scheduled(task_id)? {
            return Ok(Some(task.to_record()));
        }
        if let Some(task) = self.active(task_id)? {
            return Ok(Some(task.to_record()));
        }
        Ok(self.completed(task_id)?.map(|task| task.to_record()))
    }

    pub fn list(&self, location: Option<TaskLocation>) -> Result<Vec<TaskRecord>> {
        let conn = self.conn();
        let mut records = Vec::new();
        if matches!(location, None | Some(TaskLocation::Scheduled)) {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM scheduled_tasks ORDER BY time_to_start, task_id"
            ))?;
            for task in stmt.query_map([], scheduled_from_row)? {
                records.push(task?.to_record());
            }
        }
        if matches!(location, None | Some(TaskLocation::Active)) {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS}, time_stamp, task_dir, status, status_info,
                     next_check_time, task_lock, last_pickled_state
                 FROM active_tasks ORDER BY task_id"
            ))?;
            for task in stmt.query_map([], active_from_row)? {
                records.push(task?.to_record());
            }
        }
        if matches!(location, None | Some(TaskLocation::Completed)) {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS}, time_stamp, task_dir, status, status_info, finished_at
                 FROM completed_tasks ORDER BY finished_at, task_id"
            ))?;
            for task in stmt.query_map([], completed_from_row)? {
                records.push(task?.to_record());
            }
        }
        Ok(records)
    }
}

impl ScheduledTask {
    pub fn to_record(&self) -> TaskRecord {
        TaskRecord {
            task_id: self.task_id,
            location: TaskLocation::Scheduled,
            resource: self.resource.clone(),
            app: self.app.clone(),
            time_to_start: Some(format_time(self.time_to_start)),
            repeat_in: self.repeat_in.clone(),
            time_stamp: None,
            status: None,
            status_info: None,
            next_check_time: None,
            parent_id: self.parent_id,
            group_id: self.group_id.clone(),
            task_lock: 0,
        }
    }
}

impl ActiveTask {
    pub fn to_record(&self) -> TaskRecord {
        TaskRecord {
            location: TaskLocation::Active,
            time_stamp: Some(self.time_stamp.clone()),
            status: Some(self.status),
            status_info: Some(self.status_info.clone()),
            next_check_time: Some(format_time(self.next_check_time)),
            task_lock: self.task_lock,
            ..self.task.to_record()
        }
    }
}

impl CompletedTask {
    pub fn to_record(&self) -> TaskRecord {
        TaskRecord {
            location: TaskLocation::Completed,
            time_stamp: Some(self.time_stamp.clone()),
            status: Some(self.status),
            status_info: Some(self.status_info.clone()),
            ..self.task.to_record()
        }
    }
}

fn insert_scheduled_in(tx: &Transaction<'_>, new: &NewTask) -> Result<TaskId> {
    tx.execute("INSERT INTO task_id_seq DEFAULT VALUES", [])?;
    let task_id = tx.last_insert_rowid();
    tx.execute(
        &format!("INSERT INTO scheduled_tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
        params![
            task_id,
            new.resource,
            new.app,
            format_time(new.time_to_start),
            new.repeat_in,
            json_text(&new.params.resource_param)?,
            json_text(&new.params.app_param)?,
            json_text(&new.params.task_param)?,
            new.parent_id,
            new.group_id,
        ],
    )?;
    Ok(task_id)
}

fn json_text(map: &Map<String, Value>) -> Result<String> {
    Ok(serde_json::to_string(map)?)
}

fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDateTime> {
    let raw: String = row.get(idx)?;
    NaiveDateTime::parse_from_str(&raw, TIME_FORMAT).map_err(|e| conversion_error(idx, e))
}

fn map_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Map<String, Value>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn status_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<TaskStatus> {
    let raw: String = row.get(idx)?;
    TaskStatus::parse(&raw).ok_or_else(|| conversion_error(idx, format!("unknown task status '{raw}'")))
}

fn scheduled_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduledTask> {
    Ok(ScheduledTask {
        task_id: row.get(0)?,
        resource: row.get(1)?,
        app: row.get(2)?,
        time_to_start: time_column(row, 3)?,
        repeat_in: row.get(4)?,
        params: TaskParams {
            resource_param: map_column(row, 5)?,
            app_param: map_column(row, 6)?,
            task_param: map_column(row, 7)?,
        },
        parent_id: row.get(8)?,
        group_id: row.get(9)?,
    })
}

fn active_from_row(row: &Row<'_>) -> rusqlite::Result<ActiveTask> {
    Ok(ActiveTask {
        task: scheduled_from_row(row)?,
        time_stamp: row.get(10)?,
        task_dir: PathBuf::from(row.get::<_, String>(11)?),
        status: status_column(row, 12)?,
        status_info: row.get(13)?,
        next_check_time: time_column(row, 14)?,
        task_lock: row.get(15)?,
        last_pickled_state: row.get(16)?,
    })
}

fn completed_from_row(row: &Row<'_>) -> rusqlite::Result<CompletedTask> {
    Ok(CompletedTask {
        task: scheduled_from_row(row)?,
        time_stamp: row.get(10)?,
        task_dir: PathBuf::from(row.get::<_, String>(11)?),
        status: status_column(row, 12)?,
        status_info: row.get(13)?,
        finished_at: time_column(row, 14)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recurrence::parse_time;
    use std::sync::Arc;

    fn new_task(start: &str) -> NewTask {
        NewTask {
            resource: "c1".into(),
            app: "hpl".into(),
            time_to_start: parse_time(start).unwrap(),
            repeat_in: None,
            params: TaskParams::default(),
            parent_id: None,
            group_id: None,
        }
    }

    fn progress(status: TaskStatus, next: &str) -> Progress {
        Progress {
            status,
            status_info: "ok".into(),
            next_check_time: parse_time(next).unwrap(),
            version: 1,
        }
    }

    fn activate(store: &TaskStore, start: &str) -> TaskId {
        let id = store.insert_scheduled(&new_task(start)).unwrap();
        let task = store.scheduled(id).unwrap().unwrap();
        store
            .promote(
                &task,
                "2024.01.01.00.00.00.000000",
                Path::new("/data/c1/hpl/x"),
                &progress(TaskStatus::Created, start),
            )
            .unwrap();
        id
    }

    #[test]
    fn ids_are_never_reused() {
        let store = TaskStore::open_in_memory().unwrap();
        let first = store.insert_scheduled(&new_task("2024-01-01 00:00:00")).unwrap();
        assert!(store.delete_scheduled(first).unwrap());
        let second = store.insert_scheduled(&new_task("2024-01-01 00:00:00")).unwrap();
        assert!(second > first);
    }

    #[test]
    fn due_scheduled_is_ordered_by_start() {
        let store = TaskStore::open_in_memory().unwrap();
        let late = store.insert_scheduled(&new_task("2024-01-02 00:00:00")).unwrap();
        let early = store.insert_scheduled(&new_task("2024-01-01 00:00:00")).unwrap();
        store.insert_scheduled(&new_task("2030-01-01 00:00:00")).unwrap();

        let due: Vec<TaskId> = store
            .due_scheduled(parse_time("2024-06-01 00:00:00").unwrap())
            .unwrap()
            .iter()
            .map(|t| t.task_id)
            .collect();
        assert_eq!(due, vec![early, late]);
    }

    #[test]
    fn rows_move_between_tables() {
        let store = TaskStore::open_in_memory().unwrap();
        let id = activate(&store, "2024-01-01 00:00:00");
        assert!(store.scheduled(id).unwrap().is_none());
        assert_eq!(store.get(id).unwrap().unwrap().location, TaskLocation::Active);

        store
            .complete(
                id,
                TaskStatus::Done,
                "finished",
                Path::new("/completed/c1/hpl/x"),
                parse_time("2024-01-01 01:00:00").unwrap(),
                None,
            )
            .unwrap();
        assert!(store.active(id).unwrap().is_none());
        let done = store.completed(id).unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Done);
        assert_eq!(done.task_dir, PathBuf::from("/completed/c1/hpl/x"));
        assert_eq!(store.list(None).unwrap().len(), 1);
        assert!(store.list(Some(TaskLocation::Active)).unwrap().is_empty());
    }

    #[test]
    fn completion_and_next_run_commit_together() {
        let store = TaskStore::open_in_memory().unwrap();
        let id = activate(&store, "2024-01-01 00:00:00");
        let mut next = new_task("2024-01-02 03:00:00");
        next.parent_id = Some(id);

        let finished = parse_time("2024-01-01 01:00:00").unwrap();
        let child = store
            .complete(id, TaskStatus::Done, "", Path::new("/completed/x"), finished, Some(&next))
            .unwrap()
            .unwrap();
        assert!(child > id);
        assert_eq!(store.scheduled(child).unwrap().unwrap().parent_id, Some(id));
        assert_eq!(store.get(id).unwrap().unwrap().location, TaskLocation::Completed);

        // a second completion of the same row rolls back without leaving a child behind
        let err = store
            .complete(id, TaskStatus::Done, "", Path::new("/completed/x"), finished, Some(&next))
            .unwrap_err();
        assert!(matches!(err, AkrunError::TaskNotFound(_)));
        assert_eq!(store.scheduled_children(id).unwrap(), vec![child]);
    }

    #[test]
    fn deferral_needs_the_lock() {
        let store = TaskStore::open_in_memory().unwrap();
        let id = activate(&store, "2024-01-01 00:00:00");
        let later = parse_time("2024-01-01 02:00:00").unwrap();
        assert!(!store.defer_active(id, DAEMON_LOCK, "waiting", later).unwrap());

        store.try_lock_active(id, DAEMON_LOCK).unwrap();
        assert!(store.defer_active(id, DAEMON_LOCK, "waiting", later).unwrap());
        let row = store.active(id).unwrap().unwrap();
        assert_eq!(row.next_check_time, later);
        assert_eq!(row.status_info, "waiting");
        assert_eq!(row.status, TaskStatus::Created);
    }

    #[test]
    fn writes_require_the_lock() {
        let store = TaskStore::open_in_memory().unwrap();
        let id = activate(&store, "2024-01-01 00:00:00");
        let update = progress(TaskStatus::QueuedRemote, "2024-01-01 00:05:00");

        assert!(!store.record_progress(id, DAEMON_LOCK, &update).unwrap());
        assert!(store.try_lock_active(id, DAEMON_LOCK).unwrap());
        assert!(!store.try_lock_active(id, FRONTEND_LOCK).unwrap());
        assert!(!store.record_progress(id, FRONTEND_LOCK, &update).unwrap());
        assert!(store.record_progress(id, DAEMON_LOCK, &update).unwrap());
        store.unlock_active(id, DAEMON_LOCK).unwrap();

        let row = store.active(id).unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::QueuedRemote);
        assert_eq!(row.task_lock, 0);
    }

    #[test]
    fn clear_locks_releases_everything() {
        let store = TaskStore::open_in_memory().unwrap();
        let a = activate(&store, "2024-01-01 00:00:00");
        let b = activate(&store, "2024-01-01 00:00:00");
        store.try_lock_active(a, DAEMON_LOCK).unwrap();
        store.try_lock_active(b, FRONTEND_LOCK).unwrap();
        assert_eq!(store.clear_locks().unwrap(), 2);
        assert!(store.try_lock_active(a, DAEMON_LOCK).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_only_proceeds_after_release() {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let id = activate(&store, "2024-01-01 00:00:00");
        assert!(store.try_lock_active(id, DAEMON_LOCK).unwrap());

        let poll = Duration::from_millis(450);
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .lock_active_when_free(id, FRONTEND_LOCK, poll, Duration::from_secs(60))
                    .await
                    .unwrap();
                Instant::now()
            })
        };

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(store.active(id).unwrap().unwrap().task_lock, DAEMON_LOCK);

        let released = Instant::now();
        store.unlock_active(id, DAEMON_LOCK).unwrap();
        let acquired = waiter.await.unwrap();
        assert!(acquired - released <= poll);
        assert_eq!(store.active(id).unwrap().unwrap().task_lock, FRONTEND_LOCK);
    }

    #[tokio::test(start_paused = true)]
    async fn lock_that_never_clears_is_stale() {
        let store = TaskStore::open_in_memory().unwrap();
        let id = activate(&store, "2024-01-01 00:00:00");
        store.try_lock_active(id, DAEMON_LOCK).unwrap();
        let err = store
            .lock_active_when_free(id, FRONTEND_LOCK, Duration::from_millis(450), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, AkrunError::StaleLock { task_id, .. } if task_id == id));
    }

    #[test]
    fn params_survive_storage() {
        let store = TaskStore::open_in_memory().unwrap();
        let mut task = new_task("2024-01-01 00:00:00");
        task.params
            .task_param
            .insert("nodes".into(), Value::from(4));
        task.repeat_in = Some("1".into());
        let id = store.insert_scheduled(&task).unwrap();
        let loaded = store.scheduled(id).unwrap().unwrap();
        assert_eq!(loaded.params.task_param["nodes"], 4);
        assert_eq!(loaded.repeat_in.as_deref(), Some("1"));
    }
}

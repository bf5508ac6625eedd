use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use surrealdb::engine::local::{Db, SurrealKv};
use surrealdb::Surreal;

use crate::models::{Folder, FolderStatus, LogEntry, Task, TaskPatch, TaskStatus};
use crate::store::{JobStore, RecoveryReport, StoreError};

/// SurrealDB-backed store (embedded, SurrealKV on disk).
/// Clone is cheap (Arc internally).
#[derive(Clone)]
pub struct SurrealStore {
    pub db: Surreal<Db>,
}

/// Open the database file, select ns/db and run migrations.
pub async fn open(path: &Path) -> Result<SurrealStore, StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| StoreError::DbError(format!("create {}: {e}", parent.display())))?;
    }

    let db = Surreal::new::<SurrealKv>(path.to_path_buf()).await.map_err(db_err)?;
    db.use_ns("cloudsync").use_db("cloudsync").await.map_err(db_err)?;

    run_migrations(&db).await?;
    Ok(SurrealStore { db })
}

/// Run schema migrations. DEFINE statements are idempotent.
async fn run_migrations(db: &Surreal<Db>) -> Result<(), StoreError> {
    db.query(SCHEMA_V1).await.map_err(db_err)?.check().map_err(db_err)?;
    Ok(())
}

fn db_err(e: surrealdb::Error) -> StoreError {
    StoreError::DbError(e.to_string())
}

/// Unique-index violations come back as plain query errors; sniff them out.
fn insert_err(e: surrealdb::Error, local_path: &str) -> StoreError {
    let msg = e.to_string();
    if msg.contains("idx_task_local_path") || msg.contains("already contains") {
        StoreError::Duplicate(local_path.to_string())
    } else {
        StoreError::DbError(msg)
    }
}

fn decode<T: DeserializeOwned>(row: serde_json::Value) -> Result<T, StoreError> {
    serde_json::from_value(row).map_err(|e| StoreError::Decode(e.to_string()))
}

fn decode_all<T: DeserializeOwned>(rows: Vec<serde_json::Value>) -> Result<Vec<T>, StoreError> {
    rows.into_iter().map(decode).collect()
}

/// Same string form serde gives `DateTime<Utc>` in `CONTENT` inserts.
fn stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn code<S: Into<u8>>(status: S) -> i64 {
    i64::from(status.into())
}

impl SurrealStore {
    async fn select_one<T: DeserializeOwned>(&self, sql: &str, key: &str) -> Result<Option<T>, StoreError> {
        let mut response = self
            .db
            .query(sql)
            .bind(("key", key.to_string()))
            .await
            .map_err(db_err)?;

        let row: Option<serde_json::Value> = response.take(0).map_err(db_err)?;
        row.map(decode).transpose()
    }

    async fn select_by_status<T: DeserializeOwned>(&self, sql: &str, status: i64) -> Result<Vec<T>, StoreError> {
        let mut response = self
            .db
            .query(sql)
            .bind(("status", status))
            .await
            .map_err(db_err)?;

        let rows: Vec<serde_json::Value> = response.take(0).map_err(db_err)?;
        decode_all(rows)
    }

    /// Run a `... RETURN uid` update and report whether any record matched.
    async fn changed(&self, sql: &str, uid: &str, from: i64, to: i64) -> Result<bool, StoreError> {
        let mut response = self
            .db
            .query(sql)
            .bind(("uid", uid.to_string()))
            .bind(("from", from))
            .bind(("to", to))
            .await
            .map_err(db_err)?;

        let rows: Vec<serde_json::Value> = response.take(0).map_err(db_err)?;
        Ok(!rows.is_empty())
    }

    async fn count(&self, sql: &str, status: Option<i64>) -> Result<u64, StoreError> {
        let mut query = self.db.query(sql);
        if let Some(status) = status {
            query = query.bind(("status", status));
        }
        let mut response = query.await.map_err(db_err)?;

        let row: Option<serde_json::Value> = response.take(0).map_err(db_err)?;
        Ok(row.and_then(|r| r["total"].as_u64()).unwrap_or(0))
    }
}

#[async_trait]
impl JobStore for SurrealStore {
    async fn insert_folder(&self, folder: &Folder) -> Result<(), StoreError> {
        let content = serde_json::to_value(folder).map_err(|e| StoreError::Decode(e.to_string()))?;
        self.db
            .query("CREATE folder CONTENT $content")
            .bind(("content", content))
            .await
            .map_err(db_err)?
            .check()
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_folder(&self, id: &str) -> Result<Option<Folder>, StoreError> {
        self.select_one("SELECT * OMIT id FROM folder WHERE uid = $key LIMIT 1", id).await
    }

    async fn find_folders(&self, status: FolderStatus) -> Result<Vec<Folder>, StoreError> {
        self.select_by_status(
            "SELECT * OMIT id FROM folder WHERE status = $status ORDER BY created_at ASC",
            code(status),
        )
        .await
    }

    async fn transition_folder(&self, id: &str, from: FolderStatus, to: FolderStatus) -> Result<bool, StoreError> {
        self.changed(
            "UPDATE folder SET status = $to WHERE uid = $uid AND status = $from RETURN uid",
            id,
            code(from),
            code(to),
        )
        .await
    }

    async fn finish_folder_scan(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.db
            .query("UPDATE folder SET status = $status, last_sync_at = $at WHERE uid = $uid")
            .bind(("uid", id.to_string()))
            .bind(("status", code(FolderStatus::Watching)))
            .bind(("at", stamp(at)))
            .await
            .map_err(db_err)?
            .check()
            .map_err(db_err)?;
        Ok(())
    }

    async fn count_folders(&self) -> Result<u64, StoreError> {
        self.count("SELECT count() AS total FROM folder GROUP ALL", None).await
    }

    async fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
        let content = serde_json::to_value(task).map_err(|e| StoreError::Decode(e.to_string()))?;
        self.db
            .query("CREATE task CONTENT $content")
            .bind(("content", content))
            .await
            .map_err(|e| insert_err(e, &task.local_path))?
            .check()
            .map_err(|e| insert_err(e, &task.local_path))?;
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        self.select_one("SELECT * OMIT id FROM task WHERE uid = $key LIMIT 1", id).await
    }

    async fn find_task_by_path(&self, local_path: &str) -> Result<Option<Task>, StoreError> {
        self.select_one("SELECT * OMIT id FROM task WHERE local_path = $key LIMIT 1", local_path)
            .await
    }

    async fn find_tasks(&self, status: TaskStatus) -> Result<Vec<Task>, StoreError> {
        self.select_by_status(
            "SELECT * OMIT id FROM task WHERE status = $status ORDER BY created_at ASC",
            code(status),
        )
        .await
    }

    async fn update_task(&self, id: &str, patch: &TaskPatch) -> Result<(), StoreError> {
        let mut sets: Vec<&str> = Vec::new();
        if patch.status.is_some() {
            sets.push("status = $status");
        }
        if patch.progress.is_some() {
            sets.push("progress = $progress");
        }
        if patch.current.is_some() {
            sets.push("current = $current");
        }
        if patch.total.is_some() {
            sets.push("total = $total");
        }
        if patch.speed.is_some() {
            sets.push("speed = $speed");
        }
        if patch.eta.is_some() {
            sets.push("eta = $eta");
        }
        if patch.started_at.is_some() {
            sets.push("started_at = $started_at");
        }
        if patch.finished_at.is_some() {
            sets.push("finished_at = $finished_at");
        }
        if patch.duration.is_some() {
            sets.push("duration = $duration");
        }
        if patch.append_log.is_some() {
            sets.push("logs = string::concat(logs ?? '', $delta)");
        }
        if sets.is_empty() {
            return Ok(());
        }

        let sql = format!("UPDATE task SET {} WHERE uid = $uid RETURN uid", sets.join(", "));
        let mut query = self.db.query(sql).bind(("uid", id.to_string()));
        if let Some(status) = patch.status {
            query = query.bind(("status", code(status)));
        }
        if let Some(progress) = &patch.progress {
            query = query.bind(("progress", progress.clone()));
        }
        if let Some(current) = &patch.current {
            query = query.bind(("current", current.clone()));
        }
        if let Some(total) = &patch.total {
            query = query.bind(("total", total.clone()));
        }
        if let Some(speed) = &patch.speed {
            query = query.bind(("speed", speed.clone()));
        }
        if let Some(eta) = &patch.eta {
            query = query.bind(("eta", eta.clone()));
        }
        if let Some(at) = patch.started_at {
            query = query.bind(("started_at", stamp(at)));
        }
        if let Some(at) = patch.finished_at {
            query = query.bind(("finished_at", stamp(at)));
        }
        if let Some(duration) = &patch.duration {
            query = query.bind(("duration", duration.clone()));
        }
        if let Some(delta) = &patch.append_log {
            query = query.bind(("delta", delta.clone()));
        }

        let mut response = query.await.map_err(db_err)?;
        let rows: Vec<serde_json::Value> = response.take(0).map_err(db_err)?;
        if rows.is_empty() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn transition_task(&self, id: &str, from: TaskStatus, to: TaskStatus) -> Result<bool, StoreError> {
        self.changed(
            "UPDATE task SET status = $to WHERE uid = $uid AND status = $from RETURN uid",
            id,
            code(from),
            code(to),
        )
        .await
    }

    async fn count_tasks(&self, status: Option<TaskStatus>) -> Result<u64, StoreError> {
        match status {
            Some(status) => {
                self.count(
                    "SELECT count() AS total FROM task WHERE status = $status GROUP ALL",
                    Some(code(status)),
                )
                .await
            }
            None => self.count("SELECT count() AS total FROM task GROUP ALL", None).await,
        }
    }

    async fn add_log(&self, entry: &LogEntry) -> Result<(), StoreError> {
        let content = serde_json::to_value(entry).map_err(|e| StoreError::Decode(e.to_string()))?;
        self.db
            .query("CREATE audit_log CONTENT $content")
            .bind(("content", content))
            .await
            .map_err(db_err)?
            .check()
            .map_err(db_err)?;
        Ok(())
    }

    async fn recent_logs(&self, limit: usize) -> Result<Vec<LogEntry>, StoreError> {
        let mut response = self
            .db
            .query("SELECT name, description, created_at FROM audit_log ORDER BY created_at DESC LIMIT $limit")
            .bind(("limit", limit as i64))
            .await
            .map_err(db_err)?;

        let rows: Vec<serde_json::Value> = response.take(0).map_err(db_err)?;
        decode_all(rows)
    }

    async fn recover_interrupted(&self) -> Result<RecoveryReport, StoreError> {
        let mut response = self
            .db
            .query(
                "UPDATE folder SET status = $watching WHERE status = $scanning RETURN uid;
                 UPDATE task SET status = $pending WHERE status IN [$queued, $running] RETURN uid;",
            )
            .bind(("watching", code(FolderStatus::Watching)))
            .bind(("scanning", code(FolderStatus::Scanning)))
            .bind(("pending", code(TaskStatus::Pending)))
            .bind(("queued", code(TaskStatus::Queued)))
            .bind(("running", code(TaskStatus::Running)))
            .await
            .map_err(db_err)?;

        let folders: Vec<serde_json::Value> = response.take(0).map_err(db_err)?;
        let tasks: Vec<serde_json::Value> = response.take(1).map_err(db_err)?;

        Ok(RecoveryReport { folders_reset: folders.len() as u64, tasks_reset: tasks.len() as u64 })
    }
}

const SCHEMA_V1: &str = "
    DEFINE TABLE OVERWRITE folder SCHEMALESS;
    DEFINE INDEX OVERWRITE idx_folder_uid ON folder FIELDS uid UNIQUE;
    DEFINE INDEX OVERWRITE idx_folder_status ON folder FIELDS status;

    DEFINE TABLE OVERWRITE task SCHEMALESS;
    DEFINE INDEX OVERWRITE idx_task_uid ON task FIELDS uid UNIQUE;
    DEFINE INDEX OVERWRITE idx_task_local_path ON task FIELDS local_path UNIQUE;
    DEFINE INDEX OVERWRITE idx_task_status ON task FIELDS status;

    DEFINE TABLE OVERWRITE audit_log SCHEMALESS;
    DEFINE INDEX OVERWRITE idx_audit_created ON audit_log FIELDS created_at;
";

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_store() -> (tempfile::TempDir, SurrealStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(&tmp.path().join("test.db")).await.unwrap();
        (tmp, store)
    }

    fn task(path: &str) -> Task {
        Task::new("folder", "docs", "a.txt", path, "r", "gdrive", "1B")
    }

    #[tokio::test]
    async fn unique_index_rejects_duplicate_path() {
        let (_tmp, store) = temp_store().await;
        store.insert_task(&task("/d/a.txt")).await.unwrap();

        let err = store.insert_task(&task("/d/a.txt")).await.unwrap_err();

        assert!(matches!(err, StoreError::Duplicate(ref path) if path == "/d/a.txt"), "{err:?}");
        assert_eq!(store.count_tasks(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn log_patches_append() {
        let (_tmp, store) = temp_store().await;
        let task = task("/d/log.txt");
        store.insert_task(&task).await.unwrap();

        store.update_task(&task.id, &TaskPatch::log("one\n")).await.unwrap();
        store.update_task(&task.id, &TaskPatch::log("two\n")).await.unwrap();

        let stored = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.logs, "one\ntwo\n");
    }

    #[tokio::test]
    async fn status_transitions_are_compare_and_set() {
        let (_tmp, store) = temp_store().await;
        let task = task("/d/cas.txt");
        store.insert_task(&task).await.unwrap();

        assert!(store.transition_task(&task.id, TaskStatus::Pending, TaskStatus::Queued).await.unwrap());
        assert!(!store.transition_task(&task.id, TaskStatus::Pending, TaskStatus::Queued).await.unwrap());

        let folder = Folder::new("docs", "/d", "r", "gdrive");
        store.insert_folder(&folder).await.unwrap();
        assert!(store
            .transition_folder(&folder.id, FolderStatus::Unscanned, FolderStatus::Scanning)
            .await
            .unwrap());
        assert!(!store
            .transition_folder(&folder.id, FolderStatus::Unscanned, FolderStatus::Scanning)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn counts_by_status() {
        let (_tmp, store) = temp_store().await;
        let pending = task("/d/p.txt");
        let mut done = task("/d/s.txt");
        done.status = TaskStatus::Succeeded;
        store.insert_task(&pending).await.unwrap();
        store.insert_task(&done).await.unwrap();
        store.insert_folder(&Folder::new("docs", "/d", "r", "gdrive")).await.unwrap();

        assert_eq!(store.count_tasks(Some(TaskStatus::Pending)).await.unwrap(), 1);
        assert_eq!(store.count_tasks(Some(TaskStatus::Succeeded)).await.unwrap(), 1);
        assert_eq!(store.count_tasks(Some(TaskStatus::Failed)).await.unwrap(), 0);
        assert_eq!(store.count_tasks(None).await.unwrap(), 2);
        assert_eq!(store.count_folders().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn recovery_resets_in_flight_work() {
        let (_tmp, store) = temp_store().await;
        let mut queued = task("/d/q.txt");
        queued.status = TaskStatus::Queued;
        let mut running = task("/d/r.txt");
        running.status = TaskStatus::Running;
        let mut failed = task("/d/f.txt");
        failed.status = TaskStatus::Failed;
        let mut scanning = Folder::new("docs", "/d", "r", "gdrive");
        scanning.status = FolderStatus::Scanning;
        for t in [&queued, &running, &failed] {
            store.insert_task(t).await.unwrap();
        }
        store.insert_folder(&scanning).await.unwrap();

        let report = store.recover_interrupted().await.unwrap();

        assert_eq!(report, RecoveryReport { folders_reset: 1, tasks_reset: 2 });
        assert_eq!(store.get_task(&queued.id).await.unwrap().unwrap().status, TaskStatus::Pending);
        assert_eq!(store.get_task(&running.id).await.unwrap().unwrap().status, TaskStatus::Pending);
        assert_eq!(store.get_task(&failed.id).await.unwrap().unwrap().status, TaskStatus::Failed);
        assert_eq!(
            store.get_folder(&scanning.id).await.unwrap().unwrap().status,
            FolderStatus::Watching
        );
    }

    #[tokio::test]
    async fn patched_timestamps_match_inserted_format() {
        let (_tmp, store) = temp_store().await;
        let task = task("/d/t.txt");
        store.insert_task(&task).await.unwrap();
        let started = Utc::now();

        store
            .update_task(&task.id, &TaskPatch { started_at: Some(started), ..TaskPatch::default() })
            .await
            .unwrap();

        let stored = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.started_at, Some(started));
        let mut response = store
            .db
            .query("SELECT created_at, started_at FROM task WHERE uid = $uid")
            .bind(("uid", task.id.clone()))
            .await
            .unwrap();
        let raw: Option<serde_json::Value> = response.take(0).unwrap();
        let raw = raw.unwrap();
        let inserted = raw["created_at"].as_str().unwrap();
        let patched = raw["started_at"].as_str().unwrap();
        assert!(inserted.ends_with('Z') && patched.ends_with('Z'), "{inserted} vs {patched}");
    }
}

//! SQLite-backed task store.
//!
//! Two tables — `task_lists` and `tasks` — with a cascading foreign
//! key and secondary indexes on list id, status, and priority. All
//! reads go through a time-boxed per-list cache; every mutation
//! invalidates the entry (write-through invalidation, not update), so
//! readers fall back to SQLite on the next access. Writers serialize
//! through a single lock per store instance.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use gantry_core::{short_id, StorageConfig, TimedEntry};

use crate::model::{Task, TaskList, TaskMetadata, TaskPriority, TaskStatus};
use crate::resolver;
use crate::{Result, TaskStoreError};

/// Cached view of one list: the list row plus its task set.
#[derive(Debug, Clone)]
struct CachedList {
    list: TaskList,
    tasks: Vec<Task>,
}

/// Summary of a list's execution state.
#[derive(Debug, Clone, PartialEq)]
pub struct ListStatus {
    pub id: String,
    pub title: String,
    pub active: bool,
    pub progress_percent: f64,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub current_task_id: Option<String>,
    pub is_complete: bool,
    pub has_failures: bool,
    /// Ids of tasks currently eligible to run
    pub next_task_ids: Vec<String>,
}

/// Durable repository for task graphs.
pub struct TaskStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
    cache: RwLock<HashMap<String, TimedEntry<CachedList>>>,
    cache_ttl: Duration,
}

impl TaskStore {
    /// Open (or create) the store at the configured database path.
    pub async fn open(config: &StorageConfig) -> Result<Self> {
        if let Some(parent) = config.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(gantry_core::CoreError::Io)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            write_lock: Mutex::new(()),
            cache: RwLock::new(HashMap::new()),
            cache_ttl: config.cache_ttl(),
        };
        store.init_schema().await?;

        tracing::info!(path = %config.database_path.display(), "Task store opened");
        Ok(store)
    }

    /// Open an in-memory store (ephemeral, for tests and dry runs).
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .foreign_keys(true);

        // A single long-lived connection: an in-memory database dies
        // with its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            write_lock: Mutex::new(()),
            cache: RwLock::new(HashMap::new()),
            cache_ttl: Duration::from_secs(300),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_lists (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT,
                created_at TEXT NOT NULL,
                sequential_mode INTEGER NOT NULL DEFAULT 1,
                auto_start_next INTEGER NOT NULL DEFAULT 1,
                stop_on_failure INTEGER NOT NULL DEFAULT 1,
                active INTEGER NOT NULL DEFAULT 0,
                current_task_id TEXT,
                total_tasks INTEGER NOT NULL DEFAULT 0,
                completed_tasks INTEGER NOT NULL DEFAULT 0,
                failed_tasks INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                list_id TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                status TEXT NOT NULL,
                priority TEXT NOT NULL,
                depends_on TEXT,
                blocks TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                estimated_duration REAL,
                tags TEXT,
                metadata TEXT,
                success INTEGER,
                result_data TEXT,
                error_message TEXT,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (list_id) REFERENCES task_lists (id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for index in [
            "CREATE INDEX IF NOT EXISTS idx_tasks_list_id ON tasks(list_id)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_priority ON tasks(priority)",
        ] {
            sqlx::query(index).execute(&self.pool).await?;
        }

        Ok(())
    }

    /// Create a new task list.
    pub async fn create_list(
        &self,
        title: impl Into<String>,
        description: impl Into<String>,
        sequential: bool,
        auto_start: bool,
    ) -> Result<TaskList> {
        let list = TaskList::new(short_id(), title)?
            .with_description(description)
            .with_modes(sequential, auto_start);

        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"
            INSERT INTO task_lists
                (id, title, description, created_at, sequential_mode,
                 auto_start_next, stop_on_failure, active)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&list.id)
        .bind(&list.title)
        .bind(&list.description)
        .bind(list.created_at.to_rfc3339())
        .bind(list.sequential_mode)
        .bind(list.auto_start_next)
        .bind(list.stop_on_failure)
        .bind(list.active)
        .execute(&self.pool)
        .await?;
        drop(_guard);

        self.invalidate(&list.id).await;

        tracing::info!(list_id = %list.id, title = %list.title, "Created task list");
        Ok(list)
    }

    /// Add a task to a list.
    ///
    /// Fails with [`TaskStoreError::ListNotFound`] if the list does not
    /// exist. Dependency ids that do not yet resolve to existing tasks
    /// are accepted with a warning — graphs may be built incrementally.
    pub async fn add_task(
        &self,
        list_id: &str,
        title: impl Into<String>,
        description: impl Into<String>,
        depends_on: Vec<String>,
        priority: TaskPriority,
        estimated_duration: Option<Duration>,
    ) -> Result<Task> {
        let mut task = Task::new(short_id(), title)?
            .with_description(description)
            .with_depends_on(depends_on)
            .with_priority(priority);
        if let Some(duration) = estimated_duration {
            task = task.with_estimated_duration(duration);
        }

        self.insert_task(list_id, task).await
    }

    /// Add a task carrying a typed dispatch payload and tags.
    pub async fn add_task_with_metadata(
        &self,
        list_id: &str,
        title: impl Into<String>,
        description: impl Into<String>,
        depends_on: Vec<String>,
        priority: TaskPriority,
        metadata: TaskMetadata,
        tags: Vec<String>,
    ) -> Result<Task> {
        let task = Task::new(short_id(), title)?
            .with_description(description)
            .with_depends_on(depends_on)
            .with_priority(priority)
            .with_estimated_duration(Duration::from_secs(metadata.timeout_secs))
            .with_metadata(metadata)
            .with_tags(tags);

        self.insert_task(list_id, task).await
    }

    async fn insert_task(&self, list_id: &str, task: Task) -> Result<Task> {
        if self.load_list(list_id).await?.is_none() {
            return Err(TaskStoreError::ListNotFound(list_id.to_string()));
        }

        if !task.depends_on.is_empty() {
            let existing = self.tasks_for_list(list_id).await?;
            let known: std::collections::HashSet<&str> =
                existing.iter().map(|t| t.id.as_str()).collect();
            let unresolved: Vec<&String> = task
                .depends_on
                .iter()
                .filter(|d| !known.contains(d.as_str()))
                .collect();
            if !unresolved.is_empty() {
                tracing::warn!(
                    list_id = %list_id,
                    task_id = %task.id,
                    unresolved = ?unresolved,
                    "Dependencies not found yet; validated lazily at scheduling time"
                );
            }
        }

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO tasks
                (id, list_id, title, description, status, priority, depends_on,
                 blocks, created_at, started_at, completed_at, estimated_duration,
                 tags, metadata, success, result_data, error_message)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(list_id)
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.status.to_string())
        .bind(task.priority.to_string())
        .bind(serde_json::to_string(&task.depends_on)?)
        .bind(serde_json::to_string(&task.blocks)?)
        .bind(task.created_at.to_rfc3339())
        .bind(task.started_at.map(|t| t.to_rfc3339()))
        .bind(task.completed_at.map(|t| t.to_rfc3339()))
        .bind(task.estimated_duration.map(|d| d.as_secs_f64()))
        .bind(serde_json::to_string(&task.tags)?)
        .bind(
            task.metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(task.success)
        .bind(
            task.result_data
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&task.error_message)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE task_lists
            SET total_tasks = (SELECT COUNT(*) FROM tasks WHERE list_id = ?),
                updated_at = CURRENT_TIMESTAMP
            WHERE id = ?
            "#,
        )
        .bind(list_id)
        .bind(list_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        drop(_guard);

        self.invalidate(list_id).await;

        tracing::info!(list_id = %list_id, task_id = %task.id, "Added task");
        Ok(task)
    }

    /// Load a task list, counters recomputed from its task set.
    pub async fn load_list(&self, list_id: &str) -> Result<Option<TaskList>> {
        Ok(self.load_entry(list_id).await?.map(|e| e.list))
    }

    /// All tasks of a list, in creation order.
    pub async fn tasks_for_list(&self, list_id: &str) -> Result<Vec<Task>> {
        Ok(self
            .load_entry(list_id)
            .await?
            .map(|e| e.tasks)
            .unwrap_or_default())
    }

    /// Tasks eligible to run now. Empty for unknown lists.
    pub async fn get_ready_tasks(&self, list_id: &str) -> Result<Vec<Task>> {
        match self.load_entry(list_id).await? {
            None => Ok(Vec::new()),
            Some(entry) => Ok(resolver::ready_tasks(
                &entry.tasks,
                entry.list.sequential_mode,
            )
            .into_iter()
            .cloned()
            .collect()),
        }
    }

    /// Mark a `todo` task as in progress and point the list at it.
    /// Returns false for unknown tasks and tasks not in `todo`.
    pub async fn start_task(&self, list_id: &str, task_id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;

        let status = self.task_status(list_id, task_id).await?;
        if status != Some(TaskStatus::Todo) {
            return Ok(false);
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?, started_at = ?, updated_at = CURRENT_TIMESTAMP
            WHERE id = ? AND list_id = ?
            "#,
        )
        .bind(TaskStatus::InProgress.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(task_id)
        .bind(list_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE task_lists SET current_task_id = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(task_id)
        .bind(list_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        drop(_guard);

        self.invalidate(list_id).await;
        Ok(true)
    }

    /// Record a task's outcome: one transaction updating the task row
    /// and the list's cached counters, clearing the current-task
    /// pointer if it pointed here. Returns false (without effect) for
    /// unknown or already-resolved tasks.
    pub async fn mark_completed(
        &self,
        list_id: &str,
        task_id: &str,
        success: bool,
        result_data: Option<serde_json::Value>,
        error_message: Option<String>,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().await;

        match self.task_status(list_id, task_id).await? {
            None => return Ok(false),
            Some(status) if status.is_terminal() => return Ok(false),
            Some(_) => {}
        }

        let status = if success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?, completed_at = ?, success = ?,
                result_data = ?, error_message = ?, updated_at = CURRENT_TIMESTAMP
            WHERE id = ? AND list_id = ?
            "#,
        )
        .bind(status.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(success)
        .bind(
            result_data
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&error_message)
        .bind(task_id)
        .bind(list_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE task_lists
            SET completed_tasks = (SELECT COUNT(*) FROM tasks WHERE list_id = ? AND status = 'completed'),
                failed_tasks = (SELECT COUNT(*) FROM tasks WHERE list_id = ? AND status = 'failed'),
                current_task_id = CASE WHEN current_task_id = ? THEN NULL ELSE current_task_id END,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = ?
            "#,
        )
        .bind(list_id)
        .bind(list_id)
        .bind(task_id)
        .bind(list_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        drop(_guard);

        self.invalidate(list_id).await;

        tracing::info!(
            list_id = %list_id,
            task_id = %task_id,
            success = success,
            "Marked task completed"
        );
        Ok(true)
    }

    /// Flip a list's active flag. Returns false for unknown lists.
    pub async fn set_list_active(&self, list_id: &str, active: bool) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "UPDATE task_lists SET active = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(active)
        .bind(list_id)
        .execute(&self.pool)
        .await?;
        drop(_guard);

        self.invalidate(list_id).await;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a list and (by cascade) its tasks.
    pub async fn delete_list(&self, list_id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM task_lists WHERE id = ?")
            .bind(list_id)
            .execute(&self.pool)
            .await?;
        drop(_guard);

        self.invalidate(list_id).await;
        Ok(result.rows_affected() > 0)
    }

    /// Retention cleanup: delete inactive lists older than the cutoff.
    pub async fn cleanup_old_lists(&self, days: i64) -> Result<u64> {
        let cutoff = (Utc::now() - ChronoDuration::days(days)).to_rfc3339();

        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "DELETE FROM task_lists WHERE created_at < ? AND active = 0",
        )
        .bind(&cutoff)
        .execute(&self.pool)
        .await?;
        drop(_guard);

        self.cache.write().await.clear();

        tracing::info!(days = days, deleted = result.rows_affected(), "Cleaned up old task lists");
        Ok(result.rows_affected())
    }

    /// Execution summary for a list. `None` for unknown lists.
    pub async fn list_status(&self, list_id: &str) -> Result<Option<ListStatus>> {
        let entry = match self.load_entry(list_id).await? {
            Some(entry) => entry,
            None => return Ok(None),
        };

        let next_task_ids = resolver::ready_tasks(&entry.tasks, entry.list.sequential_mode)
            .into_iter()
            .map(|t| t.id.clone())
            .collect();

        let list = entry.list;
        Ok(Some(ListStatus {
            progress_percent: list.progress_percent(),
            is_complete: list.is_complete(),
            has_failures: list.has_failures(),
            id: list.id,
            title: list.title,
            active: list.active,
            total_tasks: list.total_tasks,
            completed_tasks: list.completed_tasks,
            failed_tasks: list.failed_tasks,
            current_task_id: list.current_task_id,
            next_task_ids,
        }))
    }

    async fn task_status(
        &self,
        list_id: &str,
        task_id: &str,
    ) -> Result<Option<TaskStatus>> {
        let row = sqlx::query("SELECT status FROM tasks WHERE id = ? AND list_id = ?")
            .bind(task_id)
            .bind(list_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            None => Ok(None),
            Some(row) => {
                let status: String = row.try_get("status")?;
                Ok(Some(status.parse()?))
            }
        }
    }

    async fn load_entry(&self, list_id: &str) -> Result<Option<CachedList>> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(list_id).and_then(|e| e.get()) {
                return Ok(Some(cached.clone()));
            }
        }

        let row = sqlx::query("SELECT * FROM task_lists WHERE id = ?")
            .bind(list_id)
            .fetch_optional(&self.pool)
            .await?;
        let mut list = match row {
            None => return Ok(None),
            Some(row) => list_from_row(&row)?,
        };

        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE list_id = ? ORDER BY created_at ASC",
        )
        .bind(list_id)
        .fetch_all(&self.pool)
        .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            match task_from_row(row) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    let id: String = row.try_get("id").unwrap_or_default();
                    tracing::error!(task_id = %id, error = %e, "Failed to load task row");
                }
            }
        }

        // The stored counters are a cache; the task set is the truth.
        list.total_tasks = tasks.len();
        list.completed_tasks = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        list.failed_tasks = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .count();

        let entry = CachedList { list, tasks };
        self.cache.write().await.insert(
            list_id.to_string(),
            TimedEntry::new(entry.clone(), self.cache_ttl),
        );

        Ok(Some(entry))
    }

    async fn invalidate(&self, list_id: &str) {
        self.cache.write().await.remove(list_id);
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TaskStoreError::Validation(format!("Bad timestamp '{}': {}", s, e)))
}

fn list_from_row(row: &SqliteRow) -> Result<TaskList> {
    let created_at: String = row.try_get("created_at")?;

    Ok(TaskList {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        description: row
            .try_get::<Option<String>, _>("description")?
            .unwrap_or_default(),
        created_at: parse_ts(&created_at)?,
        sequential_mode: row.try_get("sequential_mode")?,
        auto_start_next: row.try_get("auto_start_next")?,
        stop_on_failure: row.try_get("stop_on_failure")?,
        active: row.try_get("active")?,
        current_task_id: row.try_get("current_task_id")?,
        total_tasks: row.try_get::<i64, _>("total_tasks")? as usize,
        completed_tasks: row.try_get::<i64, _>("completed_tasks")? as usize,
        failed_tasks: row.try_get::<i64, _>("failed_tasks")? as usize,
    })
}

fn task_from_row(row: &SqliteRow) -> Result<Task> {
    let status: String = row.try_get("status")?;
    let priority: String = row.try_get("priority")?;
    let created_at: String = row.try_get("created_at")?;
    let started_at: Option<String> = row.try_get("started_at")?;
    let completed_at: Option<String> = row.try_get("completed_at")?;

    let depends_on: Option<String> = row.try_get("depends_on")?;
    let blocks: Option<String> = row.try_get("blocks")?;
    let tags: Option<String> = row.try_get("tags")?;
    let metadata: Option<String> = row.try_get("metadata")?;
    let result_data: Option<String> = row.try_get("result_data")?;

    Ok(Task {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        description: row
            .try_get::<Option<String>, _>("description")?
            .unwrap_or_default(),
        status: status.parse()?,
        priority: priority.parse()?,
        depends_on: decode_json_list(depends_on)?,
        blocks: decode_json_list(blocks)?,
        created_at: parse_ts(&created_at)?,
        started_at: started_at.as_deref().map(parse_ts).transpose()?,
        completed_at: completed_at.as_deref().map(parse_ts).transpose()?,
        estimated_duration: row
            .try_get::<Option<f64>, _>("estimated_duration")?
            .map(Duration::from_secs_f64),
        tags: decode_json_list(tags)?,
        metadata: metadata
            .as_deref()
            .map(serde_json::from_str::<TaskMetadata>)
            .transpose()?,
        success: row.try_get("success")?,
        result_data: result_data
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        error_message: row.try_get("error_message")?,
    })
}

fn decode_json_list(raw: Option<String>) -> Result<Vec<String>> {
    match raw {
        None => Ok(Vec::new()),
        Some(s) => Ok(serde_json::from_str(&s)?),
    }
}

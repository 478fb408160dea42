//! # PgQueue
//!
//! Tasks stored in the `task_queue` table. A worker locks a batch of due tasks inside one
//! transaction, so concurrent workers skip each other's rows, records how every delivery went,
//! and commits the batch once all of them are finished.
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, Postgres};
use sqlx::types::Json;
use sqlx::Transaction;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::queue::{QueueError, Task, TaskParameters, TaskQueue};

const DEQUEUE_TASKS: &str = r#"
UPDATE task_queue
SET
    attempt = attempt + 1,
    attempted_at = NOW(),
    attempted_by = array_append(attempted_by, $3::text)
WHERE id IN (
    SELECT id
    FROM task_queue
    WHERE queue = $1 AND status = 'available' AND scheduled_at <= NOW()
    ORDER BY attempt, scheduled_at
    LIMIT $2
    FOR UPDATE SKIP LOCKED
)
RETURNING id, attempt, max_attempts, attempted_by, queue, status, target, parameters
"#;

const FINISH_TASK: &str = r#"
UPDATE task_queue
SET
    status = $3,
    last_attempt_finished_at = NOW(),
    errors = CASE WHEN $4::jsonb IS NULL THEN errors ELSE array_append(errors, $4::jsonb) END,
    scheduled_at = COALESCE(NOW() + $5::interval, scheduled_at),
    queue = COALESCE($6::text, queue)
WHERE queue = $1 AND id = $2
"#;

const INSERT_TASK: &str = r#"
INSERT INTO task_queue (attempt, created_at, scheduled_at, max_attempts, parameters, queue, status, target)
VALUES (0, NOW(), NOW(), $1, $2, $3, 'available', $4)
"#;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("invalid database url: {0}")]
    InvalidUrl(sqlx::Error),
    #[error("failed to begin transaction: {0}")]
    Connection(sqlx::Error),
    #[error("{command} on task_queue failed: {error}")]
    Query {
        command: &'static str,
        error: sqlx::Error,
    },
    #[error("task batch was already committed")]
    TransactionClosed,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, sqlx::Type)]
#[sqlx(type_name = "task_status", rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for its scheduled time and a worker.
    Available,
    Completed,
    /// Will never be delivered again.
    Failed,
}

/// A row of `task_queue` as seen by the worker that locked it.
#[derive(sqlx::FromRow, Debug)]
pub struct QueuedTask {
    pub id: i64,
    /// 1 on the first delivery.
    pub attempt: i32,
    pub max_attempts: i32,
    pub attempted_by: Vec<String>,
    pub queue: String,
    pub status: TaskStatus,
    /// Path the task body is POSTed to.
    pub target: String,
    pub parameters: Json<TaskParameters>,
}

impl QueuedTask {
    pub fn attempts_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

type SharedTransaction = Arc<Mutex<Option<Transaction<'static, Postgres>>>>;

/// A task locked by the transaction of its batch.
pub struct LockedTask {
    pub task: QueuedTask,
    txn: SharedTransaction,
}

impl fmt::Debug for LockedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedTask")
            .field("task", &self.task)
            .finish_non_exhaustive()
    }
}

impl LockedTask {
    pub async fn complete(self) -> Result<(), DatabaseError> {
        self.finish::<()>(TaskStatus::Completed, None, None).await
    }

    pub async fn fail<S: Serialize + Send + Sync>(self, error: S) -> Result<(), DatabaseError> {
        self.finish(TaskStatus::Failed, Some(error), None).await
    }

    /// Make the task available again in `queue` once `interval` has passed.
    pub async fn retry<S: Serialize + Send + Sync>(
        self,
        error: S,
        interval: time::Duration,
        queue: &str,
    ) -> Result<(), DatabaseError> {
        self.finish(TaskStatus::Available, Some(error), Some((interval, queue)))
            .await
    }

    async fn finish<S: Serialize + Send + Sync>(
        self,
        status: TaskStatus,
        error: Option<S>,
        reschedule: Option<(time::Duration, &str)>,
    ) -> Result<(), DatabaseError> {
        let (delay, queue) = reschedule.unzip();

        let mut guard = self.txn.lock().await;
        let txn = guard
            .as_deref_mut()
            .ok_or(DatabaseError::TransactionClosed)?;

        sqlx::query(FINISH_TASK)
            .bind(&self.task.queue)
            .bind(self.task.id)
            .bind(status)
            .bind(error.map(Json))
            .bind(delay)
            .bind(queue)
            .execute(txn)
            .await
            .map_err(|error| DatabaseError::Query {
                command: "UPDATE",
                error,
            })?;

        Ok(())
    }
}

/// Tasks dequeued together. Nothing recorded on them is visible until `commit`.
pub struct TaskBatch {
    pub tasks: Vec<LockedTask>,
    txn: SharedTransaction,
}

impl TaskBatch {
    pub async fn commit(self) -> Result<(), DatabaseError> {
        let txn = self
            .txn
            .lock()
            .await
            .take()
            .ok_or(DatabaseError::TransactionClosed)?;

        txn.commit().await.map_err(|error| DatabaseError::Query {
            command: "COMMIT",
            error,
        })
    }
}

/// One named queue within the `task_queue` table.
#[derive(Clone)]
pub struct PgQueue {
    name: String,
    pool: PgPool,
    /// Attempts given to tasks enqueued through `TaskQueue`.
    max_attempts: i32,
}

impl PgQueue {
    /// Create a queue whose pool connects to `url` on first use.
    pub fn new(
        queue_name: &str,
        url: &str,
        max_connections: u32,
        app_name: &'static str,
    ) -> Result<Self, DatabaseError> {
        let options = PgConnectOptions::from_str(url)
            .map_err(DatabaseError::InvalidUrl)?
            .application_name(app_name);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy_with(options);

        Ok(Self::from_pool(queue_name, pool))
    }

    pub fn from_pool(queue_name: &str, pool: PgPool) -> Self {
        Self {
            name: queue_name.to_owned(),
            pool,
            max_attempts: 1,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lock up to `limit` due tasks, counting an attempt by `worker` on each.
    /// Returns `None` when no task is due. Dropping the batch without committing rolls back.
    pub async fn dequeue_batch(
        &self,
        worker: &str,
        limit: u32,
    ) -> Result<Option<TaskBatch>, DatabaseError> {
        let mut txn = self.pool.begin().await.map_err(DatabaseError::Connection)?;

        let tasks: Vec<QueuedTask> = sqlx::query_as(DEQUEUE_TASKS)
            .bind(&self.name)
            .bind(i64::from(limit))
            .bind(worker)
            .fetch_all(&mut *txn)
            .await
            .map_err(|error| DatabaseError::Query {
                command: "UPDATE",
                error,
            })?;

        if tasks.is_empty() {
            return Ok(None);
        }

        let txn: SharedTransaction = Arc::new(Mutex::new(Some(txn)));
        let tasks = tasks
            .into_iter()
            .map(|task| LockedTask {
                task,
                txn: txn.clone(),
            })
            .collect();

        Ok(Some(TaskBatch { tasks, txn }))
    }

    /// Insert a task into `queue`, which may be another queue sharing this table.
    pub async fn insert(
        &self,
        queue: &str,
        target: &str,
        parameters: TaskParameters,
        max_attempts: i32,
    ) -> Result<(), DatabaseError> {
        sqlx::query(INSERT_TASK)
            .bind(max_attempts)
            .bind(Json(parameters))
            .bind(queue)
            .bind(target)
            .execute(&self.pool)
            .await
            .map_err(|error| DatabaseError::Query {
                command: "INSERT",
                error,
            })?;

        Ok(())
    }
}

#[async_trait]
impl TaskQueue for PgQueue {
    async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        let parameters = TaskParameters::try_from(&task)?;
        let queue = if task.queue.is_empty() {
            self.name.as_str()
        } else {
            task.queue.as_str()
        };

        self.insert(queue, &task.target, parameters, self.max_attempts)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORKER: &str = "test-worker";

    fn load_job_task(queue: &str) -> Task {
        Task::new(
            queue,
            "/tq/gcs-to-bq",
            br#"{"bucket":"backup","filePath":"handle.Order.backup_info","kindName":"Order"}"#
                .to_vec(),
        )
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a PostgreSQL database"]
    async fn test_enqueued_task_is_dequeued_once(db: PgPool) {
        let queue = PgQueue::from_pool("dequeued_once", db).with_max_attempts(3);
        queue.enqueue(load_job_task("")).await.unwrap();

        let mut batch = queue.dequeue_batch(WORKER, 10).await.unwrap().unwrap();
        assert_eq!(batch.tasks.len(), 1);

        // Locked rows are skipped while the batch is open.
        assert!(queue.dequeue_batch("other-worker", 10).await.unwrap().is_none());

        let locked = batch.tasks.pop().unwrap();
        assert_eq!(locked.task.attempt, 1);
        assert_eq!(locked.task.max_attempts, 3);
        assert_eq!(locked.task.attempted_by, vec![WORKER.to_owned()]);
        assert_eq!(locked.task.target, "/tq/gcs-to-bq");
        assert_eq!(locked.task.status, TaskStatus::Available);
        assert!(locked.task.parameters.body.contains(r#""kindName":"Order""#));

        locked.complete().await.unwrap();
        batch.commit().await.unwrap();

        assert!(queue.dequeue_batch(WORKER, 10).await.unwrap().is_none());
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a PostgreSQL database"]
    async fn test_task_is_enqueued_into_named_queue(db: PgPool) {
        let queue = PgQueue::from_pool("default", db.clone());
        queue.enqueue(load_job_task("load-jobs")).await.unwrap();

        assert!(queue.dequeue_batch(WORKER, 1).await.unwrap().is_none());

        let load_jobs = PgQueue::from_pool("load-jobs", db);
        assert!(load_jobs.dequeue_batch(WORKER, 1).await.unwrap().is_some());
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a PostgreSQL database"]
    async fn test_retried_task_moves_to_retry_queue(db: PgPool) {
        let queue = PgQueue::from_pool("retried", db.clone()).with_max_attempts(2);
        queue.enqueue(load_job_task("")).await.unwrap();

        let mut batch = queue.dequeue_batch(WORKER, 1).await.unwrap().unwrap();
        let locked = batch.tasks.pop().unwrap();
        assert!(!locked.task.attempts_exhausted());

        locked
            .retry("service unavailable", time::Duration::ZERO, "retried-slow")
            .await
            .unwrap();
        batch.commit().await.unwrap();

        let retries = PgQueue::from_pool("retried-slow", db);
        let mut batch = retries.dequeue_batch(WORKER, 1).await.unwrap().unwrap();
        let locked = batch.tasks.pop().unwrap();
        assert_eq!(locked.task.attempt, 2);
        assert!(locked.task.attempts_exhausted());

        locked.fail("service unavailable").await.unwrap();
        batch.commit().await.unwrap();

        assert!(retries.dequeue_batch(WORKER, 1).await.unwrap().is_none());
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let result = PgQueue::new("default", "not a database url", 1, "bridge-test");

        assert!(matches!(result, Err(DatabaseError::InvalidUrl(_))));
    }
}

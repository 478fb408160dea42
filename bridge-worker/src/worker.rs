use std::cmp;
use std::mem;
use std::sync::Arc;
use std::time;

use futures::future::join_all;
use reqwest::{header, StatusCode};
use tokio::sync;
use tracing::{error, info, warn};
use url::Url;

use bridge_common::pgqueue::{LockedTask, PgQueue, TaskBatch};
use bridge_common::retry::RetryPolicy;

use crate::error::{DeliveryError, TaskError, WorkerError};

pub const TASKS_TOTAL: &str = "bridge_tasks_total";
pub const TASKS_COMPLETED: &str = "bridge_tasks_completed";
pub const TASKS_RETRIED: &str = "bridge_tasks_retried";
pub const TASKS_FAILED: &str = "bridge_tasks_failed";
pub const TASKS_DATABASE_ERROR: &str = "bridge_tasks_database_error";

/// Delivers queued tasks to the bridge API, one POST per task.
pub struct DeliveryWorker<'p> {
    /// Recorded in `attempted_by` for every task this worker dequeues.
    name: String,
    queue: &'p PgQueue,
    dequeue_batch_size: u32,
    poll_interval: time::Duration,
    client: reqwest::Client,
    /// Task targets are resolved against this URL.
    base_url: Url,
    max_concurrent_jobs: usize,
    retry_policy: RetryPolicy,
}

impl<'p> DeliveryWorker<'p> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        queue: &'p PgQueue,
        dequeue_batch_size: u32,
        poll_interval: time::Duration,
        client: reqwest::Client,
        base_url: &str,
        max_concurrent_jobs: usize,
        retry_policy: RetryPolicy,
    ) -> Result<Self, WorkerError> {
        Ok(Self {
            name: name.to_owned(),
            queue,
            dequeue_batch_size,
            poll_interval,
            client,
            base_url: Url::parse(base_url)?,
            max_concurrent_jobs: cmp::max(max_concurrent_jobs, 1),
            retry_policy,
        })
    }

    /// Poll the queue until a batch of at most `limit` tasks is available.
    async fn wait_for_tasks(&self, limit: u32) -> TaskBatch {
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;

            match self.queue.dequeue_batch(&self.name, limit).await {
                Ok(Some(batch)) => return batch,
                Ok(None) => continue,
                Err(error) => {
                    error!("error while trying to dequeue tasks: {}", error);
                    continue;
                }
            }
        }
    }

    /// Process tasks as they become available, never holding more than `max_concurrent_jobs`.
    pub async fn run(&self) {
        let semaphore = Arc::new(sync::Semaphore::new(self.max_concurrent_jobs));

        info!(
            queue = self.queue.name(),
            base_url = self.base_url.as_str(),
            "starting delivery worker"
        );

        loop {
            metrics::gauge!("bridge_worker_saturation_percent").set(
                1f64 - semaphore.available_permits() as f64 / self.max_concurrent_jobs as f64,
            );

            let limit = cmp::min(semaphore.available_permits(), self.dequeue_batch_size as usize);
            let batch = self.wait_for_tasks(cmp::max(limit, 1) as u32).await;
            metrics::histogram!("bridge_dequeue_batch_size").record(batch.tasks.len() as f64);

            let Ok(permits) = semaphore
                .clone()
                .acquire_many_owned(batch.tasks.len() as u32)
                .await
            else {
                error!("delivery worker semaphore was closed");
                return;
            };

            let client = self.client.clone();
            let base_url = self.base_url.clone();
            let retry_policy = self.retry_policy.clone();

            tokio::spawn(async move {
                process_batch(batch, client, &base_url, &retry_policy).await;
                drop(permits);
            });
        }
    }
}

/// Deliver every task in `batch` concurrently, then commit the batch transaction.
pub async fn process_batch(
    mut batch: TaskBatch,
    client: reqwest::Client,
    base_url: &Url,
    retry_policy: &RetryPolicy,
) {
    let tasks = mem::take(&mut batch.tasks);

    let results = join_all(
        tasks
            .into_iter()
            .map(|task| process_task(client.clone(), base_url, task, retry_policy)),
    )
    .await;

    for result in results {
        if let Err(e) = result {
            error!("error processing task: {}", e);
        }
    }

    if let Err(e) = batch.commit().await {
        error!("error committing task batch: {}", e);
    }
}

/// Deliver a single task and record the outcome in its row.
///
/// Transient failures are retried per `retry_policy` until the task runs out of attempts.
/// Everything else fails the task right away.
async fn process_task(
    client: reqwest::Client,
    base_url: &Url,
    locked: LockedTask,
    retry_policy: &RetryPolicy,
) -> Result<(), WorkerError> {
    let labels = [("queue", locked.task.queue.clone())];

    metrics::counter!(TASKS_TOTAL, &labels).increment(1);

    let now = tokio::time::Instant::now();
    let result = send_task(
        client,
        base_url,
        &locked.task.target,
        locked.task.parameters.0.body.clone(),
    )
    .await;

    match result {
        Ok(_) => {
            locked.complete().await.map_err(|e| {
                metrics::counter!(TASKS_DATABASE_ERROR, &labels).increment(1);
                e
            })?;

            metrics::counter!(TASKS_COMPLETED, &labels).increment(1);
            metrics::histogram!("bridge_task_processing_duration_seconds", &labels)
                .record(now.elapsed().as_secs_f64());

            Ok(())
        }
        Err(error) if error.is_retryable() && !locked.task.attempts_exhausted() => {
            let retry_after = match &error {
                DeliveryError::Retryable { retry_after, .. } => *retry_after,
                _ => None,
            };
            let attempt = u32::try_from(locked.task.attempt).unwrap_or(1);
            let interval = retry_policy.retry_interval(attempt, retry_after);
            let current_queue = locked.task.queue.clone();
            let retry_queue = retry_policy.retry_queue(&current_queue);

            locked
                .retry(TaskError::from(&error), interval, retry_queue)
                .await
                .map_err(|e| {
                    metrics::counter!(TASKS_DATABASE_ERROR, &labels).increment(1);
                    e
                })?;

            warn!(
                queue = current_queue.as_str(),
                retry_in = ?interval,
                "retrying task: {}",
                error
            );
            metrics::counter!(TASKS_RETRIED, &labels).increment(1);

            Ok(())
        }
        Err(error) => {
            let attempts_exhausted = error.is_retryable();
            locked.fail(TaskError::from(&error)).await.map_err(|e| {
                metrics::counter!(TASKS_DATABASE_ERROR, &labels).increment(1);
                e
            })?;

            if attempts_exhausted {
                error!("task failed after its last attempt: {}", error);
            } else {
                error!("task failed: {}", error);
            }
            metrics::counter!(TASKS_FAILED, &labels).increment(1);

            Ok(())
        }
    }
}

/// POST a task body to `target`, resolved against `base_url`.
///
/// Connection errors, 429s and 5xx responses are retryable. Any other non-success status is not.
pub async fn send_task(
    client: reqwest::Client,
    base_url: &Url,
    target: &str,
    body: String,
) -> Result<reqwest::Response, DeliveryError> {
    let url = base_url
        .join(target)
        .map_err(|error| DeliveryError::InvalidTarget {
            target: target.to_owned(),
            error,
        })?;

    let response = client
        .post(url)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await
        .map_err(|error| DeliveryError::Retryable {
            status: error.status(),
            error,
            retry_after: None,
        })?;

    let retry_after = parse_retry_after_header(response.headers());
    let status = response.status();

    match response.error_for_status() {
        Ok(response) => Ok(response),
        Err(error) if is_retryable_status(status) => Err(DeliveryError::Retryable {
            error,
            status: Some(status),
            retry_after,
        }),
        Err(error) => Err(DeliveryError::NonRetryable {
            error,
            status: Some(status),
        }),
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Read a `Retry-After` header given either as delay seconds or as an RFC 2822 date.
/// Dates in the past and unparseable values yield `None`.
fn parse_retry_after_header(headers: &header::HeaderMap) -> Option<time::Duration> {
    let value = headers.get(header::RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(seconds) = value.parse::<u64>() {
        return Some(time::Duration::from_secs(seconds));
    }

    let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    (date.with_timezone(&chrono::Utc) - chrono::Utc::now())
        .to_std()
        .ok()
}

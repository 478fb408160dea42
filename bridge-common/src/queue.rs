//! # Queue
//!
//! The durable task queue the notification receiver hands load job requests to.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pgqueue::DatabaseError;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("task payload is not valid utf-8")]
    InvalidPayload,
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error("task queue is unavailable: {0}")]
    Unavailable(String),
}

/// A unit of work to be delivered, at least once, as a POST of `payload` to `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Name of the queue to enqueue into. Empty means the queue's own default.
    pub queue: String,
    /// Path of the endpoint the task is delivered to.
    pub target: String,
    pub payload: Vec<u8>,
}

impl Task {
    pub fn new(queue: &str, target: &str, payload: Vec<u8>) -> Self {
        Self {
            queue: queue.to_owned(),
            target: target.to_owned(),
            payload,
        }
    }
}

/// What is persisted for a task: the JSON body the worker will send.
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct TaskParameters {
    pub body: String,
}

impl TryFrom<&Task> for TaskParameters {
    type Error = QueueError;

    fn try_from(task: &Task) -> Result<Self, Self::Error> {
        let body = std::str::from_utf8(&task.payload).map_err(|_| QueueError::InvalidPayload)?;

        Ok(Self {
            body: body.to_owned(),
        })
    }
}

#[async_trait]
pub trait TaskQueue {
    async fn enqueue(&self, task: Task) -> Result<(), QueueError>;
}

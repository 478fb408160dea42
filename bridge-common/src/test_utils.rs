//! In-memory collaborators for exercising the dispatch service without Google Cloud or
//! PostgreSQL.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::import::{ImportEngine, ImportError, JobReference, LoadJob};
use crate::kinds::{CatalogError, KindCatalog, KindDescriptor, KindNameError};
use crate::queue::{QueueError, Task, TaskQueue};

/// Records every enqueued task.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    tasks: Arc<Mutex<Vec<Task>>>,
}

impl MemoryQueue {
    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.tasks.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        self.tasks.lock().unwrap().push(task);
        Ok(())
    }
}

/// Rejects every task.
#[derive(Clone, Default)]
pub struct UnavailableQueue;

#[async_trait]
impl TaskQueue for UnavailableQueue {
    async fn enqueue(&self, _task: Task) -> Result<(), QueueError> {
        Err(QueueError::Unavailable("queue is down".to_owned()))
    }
}

/// Records every submitted load job and accepts it.
#[derive(Clone, Default)]
pub struct MemoryEngine {
    jobs: Arc<Mutex<Vec<LoadJob>>>,
}

impl MemoryEngine {
    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn jobs(&self) -> Vec<LoadJob> {
        self.jobs.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImportEngine for MemoryEngine {
    async fn submit_load_job(&self, job: LoadJob) -> Result<JobReference, ImportError> {
        let mut jobs = self.jobs.lock().unwrap();
        let reference = JobReference {
            project_id: job.destination_table.project_id.clone(),
            job_id: format!("job_{}", jobs.len()),
            location: None,
        };
        jobs.push(job);

        Ok(reference)
    }
}

/// Rejects every load job.
#[derive(Clone, Default)]
pub struct RejectingEngine;

#[async_trait]
impl ImportEngine for RejectingEngine {
    async fn submit_load_job(&self, _job: LoadJob) -> Result<JobReference, ImportError> {
        Err(ImportError::Rejected("quotaExceeded: too many load jobs".to_owned()))
    }
}

/// A catalog listing a fixed set of kinds, counting how often it was asked.
#[derive(Clone, Default)]
pub struct StaticCatalog {
    kinds: Option<Vec<String>>,
    calls: Arc<AtomicUsize>,
}

impl StaticCatalog {
    pub fn new(kinds: Vec<String>) -> Self {
        Self {
            kinds: Some(kinds),
            calls: Arc::default(),
        }
    }

    /// A catalog that fails every listing.
    pub fn unavailable() -> Self {
        Self {
            kinds: None,
            calls: Arc::default(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KindCatalog for StaticCatalog {
    async fn list_kinds(&self) -> Result<Vec<String>, CatalogError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        self.kinds
            .clone()
            .ok_or_else(|| CatalogError::Unavailable("catalog is down".to_owned()))
    }
}

/// A kind descriptor, or one that cannot be named.
#[derive(Debug, Clone)]
pub struct NamedKind(Option<String>);

impl NamedKind {
    pub fn new(name: &str) -> Self {
        Self(Some(name.to_owned()))
    }

    pub fn failing() -> Self {
        Self(None)
    }
}

impl KindDescriptor for NamedKind {
    fn kind_name(&self) -> Result<String, KindNameError> {
        self.0
            .clone()
            .ok_or_else(|| KindNameError("descriptor has no registered kind".to_owned()))
    }
}

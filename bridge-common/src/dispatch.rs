//! # Dispatch
//!
//! The two stages of the bridge. Stage one turns a change notification announcing a finished
//! export into a load job request on the task queue. Stage two turns a redelivered load job
//! request into a load job in BigQuery.
use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, ConfigResolver, ServiceConfig};
use crate::context::Context;
use crate::export::{self, ImportDecision, RejectReason, DEFAULT_LAYOUTS};
use crate::import::{ImportEngine, JobReference, LoadJob, TableReference};
use crate::kinds::KindResolveError;
use crate::metrics::{record_load_job, record_notification};
use crate::notification::{ChangeNotification, LoadJobRequest};
use crate::queue::{QueueError, Task, TaskQueue};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to resolve import target kinds: {0}")]
    Kinds(#[from] KindResolveError),
    #[error("failed to encode load job request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to enqueue load job request: {0}")]
    Queue(#[from] QueueError),
}

impl DispatchError {
    /// Whether the service cannot handle any request until reconfigured or the catalog is back.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DispatchError::Config(_) | DispatchError::Kinds(_))
    }

    fn outcome(&self) -> &'static str {
        match self {
            DispatchError::Config(_) => "config_error",
            DispatchError::Kinds(_) => "kinds_error",
            DispatchError::Encode(_) => "encode_error",
            DispatchError::Queue(_) => "enqueue_failed",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ChangeOutcome {
    /// The notification is not the completion marker of an eligible export.
    Ignored(RejectReason),
    Enqueued(LoadJobRequest),
}

#[derive(Debug, PartialEq, Eq)]
pub enum LoadJobOutcome {
    /// The request was missing a bucket, file path or kind name.
    Invalid,
    Submitted(JobReference),
    /// The engine refused the job or could not be reached. Not retried.
    SubmissionFailed(String),
}

pub struct DispatchService {
    config: ConfigResolver,
    kinds: OnceCell<Arc<HashSet<String>>>,
    queue: Arc<dyn TaskQueue + Send + Sync>,
    engine: Arc<dyn ImportEngine + Send + Sync>,
}

impl DispatchService {
    pub fn new(
        config: ServiceConfig,
        queue: Arc<dyn TaskQueue + Send + Sync>,
        engine: Arc<dyn ImportEngine + Send + Sync>,
    ) -> Self {
        Self {
            config: ConfigResolver::new(config),
            kinds: OnceCell::new(),
            queue,
            engine,
        }
    }

    /// The configuration as constructed, before deferred options ran.
    pub fn config(&self) -> &ServiceConfig {
        self.config.initial()
    }

    /// False once deferred option resolution failed, which no later request can recover from.
    pub fn is_ready(&self) -> bool {
        !self.config.has_failed()
    }

    /// Resolve the eligible kinds once and keep them for the lifetime of the service.
    /// A failed resolution is not kept, so the next request tries again.
    async fn eligible_kinds(
        &self,
        ctx: &Context,
        config: &ServiceConfig,
    ) -> Result<Arc<HashSet<String>>, KindResolveError> {
        self.kinds
            .get_or_try_init(|| async {
                let kinds = config.kind_resolver().resolve(ctx.catalog.as_ref()).await?;
                info!(count = kinds.len(), "resolved import target kinds");
                Ok(Arc::new(kinds))
            })
            .await
            .cloned()
    }

    /// Stage one: enqueue a load job request when `notification` is the completion marker of
    /// an eligible export. Queue failures are returned to the caller.
    pub async fn handle_change(
        &self,
        ctx: &Context,
        notification: &ChangeNotification,
    ) -> Result<ChangeOutcome, DispatchError> {
        let outcome = self.dispatch_change(ctx, notification).await;

        record_notification(match &outcome {
            Ok(ChangeOutcome::Ignored(reason)) => reason.as_str(),
            Ok(ChangeOutcome::Enqueued(_)) => "enqueued",
            Err(error) => error.outcome(),
        });

        outcome
    }

    async fn dispatch_change(
        &self,
        ctx: &Context,
        notification: &ChangeNotification,
    ) -> Result<ChangeOutcome, DispatchError> {
        let config = self.config.resolve(ctx).await?;
        let kinds = self.eligible_kinds(ctx, &config).await?;

        let kind = match export::evaluate(
            &DEFAULT_LAYOUTS,
            notification,
            &config.backup_bucket_name,
            &kinds,
        ) {
            ImportDecision::Accept(kind) => kind,
            ImportDecision::Reject(reason) => {
                debug!(
                    bucket = notification.bucket.as_str(),
                    name = notification.name.as_str(),
                    reason = reason.as_str(),
                    "ignoring change notification"
                );
                return Ok(ChangeOutcome::Ignored(reason));
            }
        };

        let request = LoadJobRequest {
            bucket: notification.bucket.clone(),
            file_path: notification.name.clone(),
            kind_name: kind,
            time_created: notification.time_created,
        };
        let payload = serde_json::to_vec(&request)?;

        self.queue
            .enqueue(Task::new(&config.queue_name, &config.load_job_url, payload))
            .await?;

        info!(
            bucket = request.bucket.as_str(),
            name = request.file_path.as_str(),
            kind = request.kind_name.as_str(),
            queue = config.queue_name.as_str(),
            "enqueued load job request"
        );

        Ok(ChangeOutcome::Enqueued(request))
    }

    /// Stage two: submit a load job replacing the kind's table with the export in `request`.
    ///
    /// Invalid requests and failed submissions are logged and reported as outcomes rather than
    /// errors, so the task queue does not redeliver them.
    pub async fn handle_load_job(
        &self,
        ctx: &Context,
        request: &LoadJobRequest,
    ) -> Result<LoadJobOutcome, DispatchError> {
        let outcome = self.dispatch_load_job(ctx, request).await;

        record_load_job(match &outcome {
            Ok(LoadJobOutcome::Invalid) => "invalid",
            Ok(LoadJobOutcome::Submitted(_)) => "submitted",
            Ok(LoadJobOutcome::SubmissionFailed(_)) => "submission_failed",
            Err(error) => error.outcome(),
        });

        outcome
    }

    async fn dispatch_load_job(
        &self,
        ctx: &Context,
        request: &LoadJobRequest,
    ) -> Result<LoadJobOutcome, DispatchError> {
        let config = self.config.resolve(ctx).await?;

        if !request.is_valid() {
            warn!(
                bucket = request.bucket.as_str(),
                name = request.file_path.as_str(),
                kind = request.kind_name.as_str(),
                "dropping invalid load job request"
            );
            return Ok(LoadJobOutcome::Invalid);
        }

        let job = LoadJob::datastore_backup(
            request.source_uri(),
            TableReference::new(&ctx.project_id, &config.dataset_id, &request.kind_name),
        );

        match self.engine.submit_load_job(job).await {
            Ok(reference) => {
                info!(
                    kind = request.kind_name.as_str(),
                    dataset = config.dataset_id.as_str(),
                    job_id = reference.job_id.as_str(),
                    "submitted load job"
                );
                Ok(LoadJobOutcome::Submitted(reference))
            }
            Err(error) => {
                warn!(
                    kind = request.kind_name.as_str(),
                    source = request.source_uri().as_str(),
                    "failed to submit load job: {}",
                    error
                );
                Ok(LoadJobOutcome::SubmissionFailed(error.to_string()))
            }
        }
    }
}

//! # Config
//!
//! Options of the dispatch service, and the one-time resolution of options that can only be
//! computed once a request context is available.
use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use futures::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;

use crate::context::Context;
use crate::kinds::{KindDescriptor, KindResolver};

pub const DEFAULT_OCN_RECEIVE_URL: &str = "/api/gcs/object-change-notification";
pub const DEFAULT_LOAD_JOB_URL: &str = "/tq/gcs-to-bq";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid state: no import target kinds configured")]
    MissingTargetKinds,
    #[error("invalid state: no dataset id configured")]
    MissingDatasetId,
    #[error("deferred option failed: {0}")]
    Deferred(String),
    #[error("deferred option produced another deferred option")]
    NestedDeferred,
    #[error("invalid state: {0}")]
    KindNaming(String),
}

type DeferredFn =
    dyn Fn(Context) -> BoxFuture<'static, Result<ConfigOption, ConfigError>> + Send + Sync;

/// An option computed from a request context the first time the service is used.
#[derive(Clone)]
pub struct DeferredOption(Arc<DeferredFn>);

impl DeferredOption {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ConfigOption, ConfigError>> + Send + 'static,
    {
        Self(Arc::new(move |ctx: Context| f(ctx).boxed()))
    }

    async fn run(&self, ctx: Context) -> Result<ConfigOption, ConfigError> {
        (self.0)(ctx).await
    }
}

impl fmt::Debug for DeferredOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeferredOption")
    }
}

/// A single setting applied to a `ServiceConfig`. Options are applied in order, so the last
/// option touching a field wins.
#[derive(Clone, Debug)]
pub enum ConfigOption {
    /// Empty URLs leave the current value in place.
    Urls {
        ocn_receive_url: String,
        load_job_url: String,
    },
    QueueName(String),
    BackupBucketName(String),
    TargetKinds(Vec<Arc<dyn KindDescriptor>>),
    TargetKindNames(Vec<String>),
    /// Import every user-defined kind listed by the catalog.
    AllKinds,
    DatasetId(String),
    AfterContext(DeferredOption),
}

impl ConfigOption {
    fn apply(self, config: &mut ServiceConfig) {
        match self {
            ConfigOption::Urls {
                ocn_receive_url,
                load_job_url,
            } => {
                if !ocn_receive_url.is_empty() {
                    config.ocn_receive_url = ocn_receive_url;
                }
                if !load_job_url.is_empty() {
                    config.load_job_url = load_job_url;
                }
            }
            ConfigOption::QueueName(name) => config.queue_name = name,
            ConfigOption::BackupBucketName(name) => config.backup_bucket_name = name,
            ConfigOption::TargetKinds(kinds) => config.import_target_kinds = kinds,
            ConfigOption::TargetKindNames(names) => config.import_target_kind_names = names,
            ConfigOption::AllKinds => config.import_all_kinds = true,
            ConfigOption::DatasetId(id) => config.dataset_id = id,
            ConfigOption::AfterContext(deferred) => config.deferred_options.push(deferred),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub queue_name: String,
    pub backup_bucket_name: String,
    pub dataset_id: String,
    pub import_target_kind_names: Vec<String>,
    pub import_target_kinds: Vec<Arc<dyn KindDescriptor>>,
    pub import_all_kinds: bool,
    pub ocn_receive_url: String,
    pub load_job_url: String,
    deferred_options: Vec<DeferredOption>,
    deferred_applied: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            queue_name: String::new(),
            backup_bucket_name: String::new(),
            dataset_id: String::new(),
            import_target_kind_names: Vec::new(),
            import_target_kinds: Vec::new(),
            import_all_kinds: false,
            ocn_receive_url: DEFAULT_OCN_RECEIVE_URL.to_owned(),
            load_job_url: DEFAULT_LOAD_JOB_URL.to_owned(),
            deferred_options: Vec::new(),
            deferred_applied: false,
        }
    }
}

impl ServiceConfig {
    /// Initialize a `ServiceConfigBuilder`.
    pub fn build() -> ServiceConfigBuilder {
        ServiceConfigBuilder::default()
    }

    /// Construct a `ServiceConfig` by applying `options` in order to the defaults.
    pub fn from_options(
        options: impl IntoIterator<Item = ConfigOption>,
    ) -> Result<ServiceConfig, ConfigError> {
        let mut config = ServiceConfig::default();

        for option in options {
            option.apply(&mut config);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.import_target_kind_names.is_empty()
            && self.import_target_kinds.is_empty()
            && !self.import_all_kinds
        {
            return Err(ConfigError::MissingTargetKinds);
        }

        if self.dataset_id.is_empty() {
            return Err(ConfigError::MissingDatasetId);
        }

        Ok(())
    }

    pub fn has_deferred_options(&self) -> bool {
        !self.deferred_options.is_empty() && !self.deferred_applied
    }

    pub fn deferred_applied(&self) -> bool {
        self.deferred_applied
    }

    /// Replace the target kind descriptors with their names, unless names are already set.
    fn name_target_kinds(&mut self) -> Result<(), ConfigError> {
        if self.import_all_kinds
            || !self.import_target_kind_names.is_empty()
            || self.import_target_kinds.is_empty()
        {
            return Ok(());
        }

        self.import_target_kind_names = self
            .import_target_kinds
            .iter()
            .map(|descriptor| descriptor.kind_name())
            .collect::<Result<Vec<String>, _>>()
            .map_err(|error| ConfigError::KindNaming(error.to_string()))?;

        Ok(())
    }

    /// The resolver for the kinds this configuration imports.
    pub fn kind_resolver(&self) -> KindResolver {
        if self.import_all_kinds {
            return KindResolver::all_kinds();
        }

        KindResolver::new(
            self.import_target_kind_names.clone(),
            self.import_target_kinds.clone(),
        )
    }

    /// Run every deferred option in registration order and apply its result on top of a copy
    /// of this configuration.
    pub async fn apply_deferred(&self, ctx: &Context) -> Result<ServiceConfig, ConfigError> {
        let mut resolved = self.clone();
        let deferred_options = std::mem::take(&mut resolved.deferred_options);

        for deferred in deferred_options {
            match deferred.run(ctx.clone()).await? {
                ConfigOption::AfterContext(_) => return Err(ConfigError::NestedDeferred),
                option => option.apply(&mut resolved),
            }
        }

        resolved.deferred_applied = true;
        resolved.validate()?;

        Ok(resolved)
    }
}

/// Builder pattern struct to provide a `ServiceConfig`.
#[derive(Default)]
pub struct ServiceConfigBuilder {
    options: Vec<ConfigOption>,
}

impl ServiceConfigBuilder {
    pub fn option(mut self, option: ConfigOption) -> ServiceConfigBuilder {
        self.options.push(option);
        self
    }

    pub fn urls(self, ocn_receive_url: &str, load_job_url: &str) -> ServiceConfigBuilder {
        self.option(ConfigOption::Urls {
            ocn_receive_url: ocn_receive_url.to_owned(),
            load_job_url: load_job_url.to_owned(),
        })
    }

    pub fn queue_name(self, name: &str) -> ServiceConfigBuilder {
        self.option(ConfigOption::QueueName(name.to_owned()))
    }

    pub fn backup_bucket_name(self, name: &str) -> ServiceConfigBuilder {
        self.option(ConfigOption::BackupBucketName(name.to_owned()))
    }

    pub fn target_kinds(self, kinds: Vec<Arc<dyn KindDescriptor>>) -> ServiceConfigBuilder {
        self.option(ConfigOption::TargetKinds(kinds))
    }

    pub fn target_kind_names<S: AsRef<str>>(self, names: &[S]) -> ServiceConfigBuilder {
        self.option(ConfigOption::TargetKindNames(
            names.iter().map(|n| n.as_ref().to_owned()).collect(),
        ))
    }

    pub fn all_kinds(self) -> ServiceConfigBuilder {
        self.option(ConfigOption::AllKinds)
    }

    pub fn dataset_id(self, id: &str) -> ServiceConfigBuilder {
        self.option(ConfigOption::DatasetId(id.to_owned()))
    }

    pub fn after_context(self, deferred: DeferredOption) -> ServiceConfigBuilder {
        self.option(ConfigOption::AfterContext(deferred))
    }

    /// Provide a `ServiceConfig` according to the options provided thus far.
    pub fn provide(&self) -> Result<ServiceConfig, ConfigError> {
        ServiceConfig::from_options(self.options.iter().cloned())
    }
}

/// The shared, one-time resolution of a `ServiceConfig`.
type Resolution = Shared<BoxFuture<'static, Result<Arc<ServiceConfig>, ConfigError>>>;

/// Holds a `ServiceConfig` and resolves it the first time it is needed: deferred options run
/// and kind descriptors are turned into names.
///
/// The first caller starts a single resolution that every caller, including later ones, waits
/// on. A caller giving up does not restart it. Its outcome, success or failure, is kept for the
/// lifetime of the resolver.
pub struct ConfigResolver {
    initial: Arc<ServiceConfig>,
    resolution: OnceLock<Resolution>,
}

impl ConfigResolver {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            initial: Arc::new(config),
            resolution: OnceLock::new(),
        }
    }

    /// The configuration as constructed, before any deferred option ran.
    pub fn initial(&self) -> &ServiceConfig {
        &self.initial
    }

    pub async fn resolve(&self, ctx: &Context) -> Result<Arc<ServiceConfig>, ConfigError> {
        self.resolution
            .get_or_init(|| resolve_config(self.initial.clone(), ctx.clone()).boxed().shared())
            .clone()
            .await
    }

    /// Whether resolution ran and failed, leaving the service permanently unusable.
    pub fn has_failed(&self) -> bool {
        matches!(
            self.resolution.get().and_then(|resolution| resolution.peek()),
            Some(Err(_))
        )
    }
}

async fn resolve_config(
    initial: Arc<ServiceConfig>,
    ctx: Context,
) -> Result<Arc<ServiceConfig>, ConfigError> {
    let resolved = if initial.has_deferred_options() {
        tracing::info!("applying deferred service options");
        initial.apply_deferred(&ctx).await
    } else {
        Ok((*initial).clone())
    };

    match resolved.and_then(|mut config| {
        config.name_target_kinds()?;
        Ok(config)
    }) {
        Ok(config) => Ok(Arc::new(config)),
        Err(error) => {
            tracing::error!("failed to resolve service options: {}", error);
            Err(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::test_utils::{NamedKind, StaticCatalog};

    fn context() -> Context {
        Context::new("test-project", Arc::new(StaticCatalog::new(vec![])))
    }

    #[test]
    fn test_construction_requires_target_kinds() {
        let result = ServiceConfig::build().dataset_id("ds").provide();

        assert_eq!(result.unwrap_err(), ConfigError::MissingTargetKinds);
    }

    #[test]
    fn test_construction_requires_dataset_id() {
        let result = ServiceConfig::build()
            .target_kind_names(&["Order"])
            .provide();

        assert_eq!(result.unwrap_err(), ConfigError::MissingDatasetId);
    }

    #[test]
    fn test_construction_defaults() {
        let config = ServiceConfig::build()
            .target_kinds(vec![Arc::new(NamedKind::new("Order"))])
            .dataset_id("ds")
            .provide()
            .expect("failed to provide config");

        assert_eq!(config.ocn_receive_url, DEFAULT_OCN_RECEIVE_URL);
        assert_eq!(config.load_job_url, DEFAULT_LOAD_JOB_URL);
        assert_eq!(config.queue_name, "");
        assert!(!config.has_deferred_options());
    }

    #[test]
    fn test_all_kinds_satisfies_construction() {
        let config = ServiceConfig::build()
            .all_kinds()
            .dataset_id("ds")
            .provide()
            .expect("failed to provide config");

        assert!(config.import_all_kinds);
    }

    #[test]
    fn test_last_option_wins() {
        let config = ServiceConfig::build()
            .dataset_id("first")
            .target_kind_names(&["A"])
            .urls("/ocn", "/load")
            .urls("", "/load-2")
            .target_kind_names(&["B"])
            .dataset_id("second")
            .provide()
            .unwrap();

        assert_eq!(config.dataset_id, "second");
        assert_eq!(config.import_target_kind_names, vec!["B".to_owned()]);
        assert_eq!(config.ocn_receive_url, "/ocn");
        assert_eq!(config.load_job_url, "/load-2");
    }

    #[tokio::test]
    async fn test_deferred_options_apply_after_immediate_options() {
        let config = ServiceConfig::build()
            .target_kind_names(&["A"])
            .after_context(DeferredOption::new(|ctx: Context| async move {
                Ok(ConfigOption::DatasetId(format!("{}-ds", ctx.project_id)))
            }))
            .after_context(DeferredOption::new(|_| async {
                Ok(ConfigOption::QueueName("deferred".to_owned()))
            }))
            .dataset_id("immediate")
            .queue_name("immediate")
            .provide()
            .unwrap();
        let resolver = ConfigResolver::new(config);

        let resolved = resolver.resolve(&context()).await.unwrap();

        assert_eq!(resolved.dataset_id, "test-project-ds");
        assert_eq!(resolved.queue_name, "deferred");
        assert!(resolved.deferred_applied());
        assert_eq!(resolver.initial().dataset_id, "immediate");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_deferred_options_run_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();

        let config = ServiceConfig::build()
            .target_kind_names(&["A"])
            .dataset_id("ds")
            .after_context(DeferredOption::new(move |_| {
                let counted = counted.clone();
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    Ok(ConfigOption::BackupBucketName("backup".to_owned()))
                }
            }))
            .provide()
            .unwrap();
        let resolver = Arc::new(ConfigResolver::new(config));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let resolver = resolver.clone();
                tokio::spawn(async move { resolver.resolve(&context()).await })
            })
            .collect();

        for handle in futures::future::join_all(handles).await {
            let resolved = handle.expect("task panicked").expect("resolution failed");
            assert_eq!(resolved.backup_bucket_name, "backup");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_resolution_is_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();

        let config = ServiceConfig::build()
            .target_kind_names(&["A"])
            .dataset_id("ds")
            .after_context(DeferredOption::new(move |_| {
                counted.fetch_add(1, Ordering::SeqCst);
                async { Err(ConfigError::Deferred("metadata lookup failed".to_owned())) }
            }))
            .provide()
            .unwrap();
        let resolver = ConfigResolver::new(config);

        assert!(!resolver.has_failed());
        for _ in 0..3 {
            assert_eq!(
                resolver.resolve(&context()).await.unwrap_err(),
                ConfigError::Deferred("metadata lookup failed".to_owned())
            );
        }

        assert!(resolver.has_failed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deferred_options_are_validated() {
        let config = ServiceConfig::build()
            .target_kind_names(&["A"])
            .dataset_id("ds")
            .after_context(DeferredOption::new(|_| async {
                Ok(ConfigOption::DatasetId(String::new()))
            }))
            .provide()
            .unwrap();

        let result = ConfigResolver::new(config).resolve(&context()).await;

        assert_eq!(result.unwrap_err(), ConfigError::MissingDatasetId);
    }

    #[tokio::test]
    async fn test_nested_deferred_option_is_rejected() {
        let config = ServiceConfig::build()
            .target_kind_names(&["A"])
            .dataset_id("ds")
            .after_context(DeferredOption::new(|_| async {
                Ok(ConfigOption::AfterContext(DeferredOption::new(|_| async {
                    Ok(ConfigOption::AllKinds)
                })))
            }))
            .provide()
            .unwrap();

        let result = ConfigResolver::new(config).resolve(&context()).await;

        assert_eq!(result.unwrap_err(), ConfigError::NestedDeferred);
    }

    #[tokio::test]
    async fn test_abandoned_resolution_is_not_restarted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();

        let config = ServiceConfig::build()
            .target_kind_names(&["A"])
            .dataset_id("ds")
            .after_context(DeferredOption::new(move |_| {
                counted.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    Ok(ConfigOption::QueueName("deferred".to_owned()))
                }
            }))
            .provide()
            .unwrap();
        let resolver = ConfigResolver::new(config);

        let abandoned = tokio::time::timeout(
            std::time::Duration::from_millis(10),
            resolver.resolve(&context()),
        )
        .await;
        assert!(abandoned.is_err());

        let resolved = resolver.resolve(&context()).await.unwrap();

        assert_eq!(resolved.queue_name, "deferred");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_kind_descriptors_are_named_on_resolution() {
        let config = ServiceConfig::build()
            .target_kinds(vec![
                Arc::new(NamedKind::new("Order")),
                Arc::new("Customer".to_owned()),
            ])
            .dataset_id("ds")
            .provide()
            .unwrap();

        let resolved = ConfigResolver::new(config).resolve(&context()).await.unwrap();

        assert_eq!(
            resolved.import_target_kind_names,
            vec!["Order".to_owned(), "Customer".to_owned()]
        );
    }

    #[tokio::test]
    async fn test_kind_naming_failure_is_kept() {
        let config = ServiceConfig::build()
            .target_kinds(vec![Arc::new(NamedKind::failing())])
            .dataset_id("ds")
            .provide()
            .unwrap();
        let resolver = ConfigResolver::new(config);

        for _ in 0..2 {
            let error = resolver.resolve(&context()).await.unwrap_err();
            assert!(matches!(error, ConfigError::KindNaming(_)));
        }

        assert!(resolver.has_failed());
    }
}

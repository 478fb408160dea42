//! # Kinds
//!
//! Resolves the set of kind names eligible for import.
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::gcp::GcpError;

/// Kinds whose name starts with this prefix are internal to Datastore and never imported.
pub const RESERVED_KIND_PREFIX: &str = "_";

#[derive(Error, Debug, Clone)]
#[error("failed to name kind descriptor: {0}")]
pub struct KindNameError(pub String);

/// Something that can be converted into the canonical name of a kind, like an entity type
/// registered by an application.
pub trait KindDescriptor: fmt::Debug + Send + Sync {
    fn kind_name(&self) -> Result<String, KindNameError>;
}

impl KindDescriptor for String {
    fn kind_name(&self) -> Result<String, KindNameError> {
        if self.is_empty() {
            return Err(KindNameError("empty kind name".to_owned()));
        }
        Ok(self.clone())
    }
}

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error(transparent)]
    Gcp(#[from] GcpError),
    #[error("kind catalog is unavailable: {0}")]
    Unavailable(String),
}

/// The metadata catalog listing every kind known to the datastore.
#[async_trait]
pub trait KindCatalog {
    async fn list_kinds(&self) -> Result<Vec<String>, CatalogError>;
}

#[derive(Error, Debug)]
pub enum KindResolveError {
    #[error(transparent)]
    Naming(#[from] KindNameError),
    #[error("failed to list kinds: {0}")]
    Catalog(#[from] CatalogError),
}

/// Turns configured kind names or descriptors into a set of kind names, falling back to every
/// user-defined kind in the catalog when neither is configured.
#[derive(Debug, Default, Clone)]
pub struct KindResolver {
    names: Vec<String>,
    descriptors: Vec<Arc<dyn KindDescriptor>>,
}

impl KindResolver {
    pub fn new(names: Vec<String>, descriptors: Vec<Arc<dyn KindDescriptor>>) -> Self {
        Self { names, descriptors }
    }

    /// Resolve using the catalog only.
    pub fn all_kinds() -> Self {
        Self::default()
    }

    pub async fn resolve(
        &self,
        catalog: &(dyn KindCatalog + Send + Sync),
    ) -> Result<HashSet<String>, KindResolveError> {
        if !self.names.is_empty() {
            return Ok(self.names.iter().cloned().collect());
        }

        if !self.descriptors.is_empty() {
            return self
                .descriptors
                .iter()
                .map(|descriptor| descriptor.kind_name().map_err(KindResolveError::from))
                .collect();
        }

        let kinds = catalog.list_kinds().await?;
        tracing::info!(count = kinds.len(), "listed kinds from catalog");

        Ok(kinds
            .into_iter()
            .filter(|kind| !kind.starts_with(RESERVED_KIND_PREFIX))
            .collect())
    }
}

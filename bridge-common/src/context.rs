use std::fmt;
use std::sync::Arc;

use crate::kinds::KindCatalog;

/// Request scoped execution context handed to the dispatch stages and deferred options.
///
/// Dropping the future of a stage drops every downstream call it has in flight, so no
/// explicit cancellation token is carried.
#[derive(Clone)]
pub struct Context {
    pub project_id: String,
    pub catalog: Arc<dyn KindCatalog + Send + Sync>,
}

impl Context {
    pub fn new(project_id: &str, catalog: Arc<dyn KindCatalog + Send + Sync>) -> Self {
        Self {
            project_id: project_id.to_owned(),
            catalog,
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("project_id", &self.project_id)
            .finish_non_exhaustive()
    }
}

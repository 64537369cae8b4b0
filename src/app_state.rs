use std::sync::Arc;

use crate::db::store::{JobStore, ResultTable};
use crate::services::dispatcher::{Dispatcher, DispatcherConfig};
use crate::services::queue::JobQueue;
use crate::services::retry::RetryPolicy;
use crate::services::storage::ObjectStore;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub jobs: Arc<dyn JobStore>,
    pub results: Arc<dyn ResultTable>,
    pub queue: Arc<dyn JobQueue>,
    /// Store and queue calls made directly by handlers.
    pub call_retry: RetryPolicy,
}

impl AppState {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        results: Arc<dyn ResultTable>,
        queue: Arc<dyn JobQueue>,
        objects: Option<Arc<dyn ObjectStore>>,
        dispatcher_config: DispatcherConfig,
        call_retry: RetryPolicy,
    ) -> Self {
        let dispatcher = Dispatcher::new(jobs.clone(), queue.clone(), objects, dispatcher_config);
        Self {
            dispatcher: Arc::new(dispatcher),
            jobs,
            results,
            queue,
            call_retry,
        }
    }
}

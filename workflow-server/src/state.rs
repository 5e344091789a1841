use std::sync::Arc;

use workflow_core::adapters::{MessagingAdapter, TaskAdapter, VoiceAdapter};
use workflow_core::queue::JobQueue;
use workflow_core::store::StateStore;
use workflow_core::{Config, Executor, Resumer, Supervisor, TriggerMatcher};

use crate::signature::TenantSecrets;

/// Process-wide resources (§9 "Global state"): queue, store, and adapter
/// clients initialized once at startup and shared by every worker/request.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StateStore>,
    pub queue: Arc<dyn JobQueue>,
    pub resumer: Arc<Resumer>,
    pub supervisor: Arc<Supervisor>,
    pub trigger_matcher: Arc<TriggerMatcher>,
    pub config: Arc<Config>,
    pub secrets: Arc<dyn TenantSecrets>,
    pub voice: Arc<dyn VoiceAdapter>,
    pub messaging: Arc<dyn MessagingAdapter>,
    pub tasks: Arc<dyn TaskAdapter>,
}

impl AppState {
    /// Builds one `Executor` per worker goroutine/task; the executor itself
    /// is cheap to construct and holds only `Arc` clones.
    pub fn build_executor(&self, worker_id: &str) -> Executor {
        let notifier = Arc::new(workflow_core::adapters::AdminNotifier::new(
            self.messaging.clone(),
            std::env::var("WF_ADMIN_EMAIL").unwrap_or_else(|_| "ops@example.com".to_string()),
        ));
        Executor::new(
            self.store.clone(),
            self.queue.clone(),
            self.messaging.clone(),
            self.voice.clone(),
            self.tasks.clone(),
            Some(notifier),
            &self.config,
            worker_id,
        )
    }
}

//! Trigger matching, node execution, wait/resume gates, and recovery for
//! workflow runs — the execution subsystem of the workflow automation engine
//! (see `SPEC_FULL.md` §2 for the component map).

pub mod adapters;
pub mod config;
pub mod error;
pub mod executor;
pub mod model;
pub mod queue;
pub mod resumer;
pub mod store;
pub mod supervisor;
pub mod trigger_matcher;
pub mod validate;

pub use config::Config;
pub use executor::Executor;
pub use resumer::Resumer;
pub use supervisor::Supervisor;
pub use trigger_matcher::TriggerMatcher;

/// In-memory fakes for every port, wired together for unit and scenario
/// tests (`workflow-core/tests/`) without a live Postgres instance.
#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use std::sync::Arc;

    use crate::adapters::memory::{FakeMessagingAdapter, FakeTaskAdapter, FakeVoiceAdapter};
    use crate::adapters::AdminNotifier;
    use crate::config::Config;
    use crate::queue::{JobQueue, StoreBackedQueue};
    use crate::store::memory::InMemoryStore;
    use crate::store::StateStore;
    use crate::{Executor, Resumer, Supervisor, TriggerMatcher};

    /// One fully-wired engine instance backed entirely by in-memory fakes.
    pub struct Harness {
        pub store: Arc<InMemoryStore>,
        pub queue: Arc<dyn JobQueue>,
        pub messaging: Arc<FakeMessagingAdapter>,
        pub voice: Arc<FakeVoiceAdapter>,
        pub tasks: Arc<FakeTaskAdapter>,
        pub config: Config,
    }

    impl Harness {
        pub fn new() -> Self {
            let store = Arc::new(InMemoryStore::new());
            let queue: Arc<dyn JobQueue> = Arc::new(StoreBackedQueue::new(store.clone() as Arc<dyn StateStore>));
            Harness {
                store,
                queue,
                messaging: Arc::new(FakeMessagingAdapter::new()),
                voice: Arc::new(FakeVoiceAdapter::new()),
                tasks: Arc::new(FakeTaskAdapter::new()),
                config: Config::default(),
            }
        }

        pub fn trigger_matcher(&self) -> TriggerMatcher {
            TriggerMatcher::new(self.store.clone(), self.queue.clone())
        }

        pub fn executor(&self, worker_id: &str) -> Executor {
            let notifier = Arc::new(AdminNotifier::new(self.messaging.clone(), "ops@example.com"));
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

        pub fn resumer(&self) -> Arc<Resumer> {
            Arc::new(Resumer::new(self.store.clone(), self.queue.clone()))
        }

        pub fn supervisor(&self) -> Supervisor {
            Supervisor::new(
                self.store.clone(),
                self.queue.clone(),
                self.resumer(),
                self.config.supervisor.clone(),
                self.config.retention.clone(),
            )
        }
    }

    impl Default for Harness {
        fn default() -> Self {
            Self::new()
        }
    }
}

//! The Executor (§4.2): consumes node-execution jobs, loads the run,
//! dispatches to the node handler, records the result, and enqueues
//! successors or transitions the run into a wait state.

pub mod handlers;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::adapters::{AdminNotification, AdminNotifier, MessagingAdapter, TaskAdapter, VoiceAdapter};
use crate::config::{Config, RetryConfig};
use crate::error::{AdapterError, ExecutorError, StoreError};
use crate::model::{
    Edge, ExecutionLogEntry, ExecutionPathEntry, Job, JobQueueKind, JobStatus, LogStatus, Node,
    NodeConfig, PathEntryStatus, Run, RunStatus, WorkflowDefinition,
};
use crate::queue::{backoff_delay, scheduled_for, JobQueue};
use crate::store::StateStore;

use handlers::{HandlerInput, HandlerOutcome, HandlerRegistry};

pub struct Executor {
    store: Arc<dyn StateStore>,
    queue: Arc<dyn JobQueue>,
    registry: HandlerRegistry,
    admin_notifier: Option<Arc<AdminNotifier>>,
    default_execution_timeout_seconds: u64,
    default_country_prefix: String,
    retry: RetryConfig,
    worker_id: String,
}

impl Executor {
    pub fn new(
        store: Arc<dyn StateStore>,
        queue: Arc<dyn JobQueue>,
        messaging: Arc<dyn MessagingAdapter>,
        voice: Arc<dyn VoiceAdapter>,
        tasks: Arc<dyn TaskAdapter>,
        admin_notifier: Option<Arc<AdminNotifier>>,
        config: &Config,
        worker_id: impl Into<String>,
    ) -> Self {
        Executor {
            store,
            queue,
            registry: HandlerRegistry::new(messaging, voice, tasks),
            admin_notifier,
            default_execution_timeout_seconds: config.default_execution_timeout_seconds,
            default_country_prefix: config.default_country_prefix.clone(),
            retry: config.retry.clone(),
            worker_id: worker_id.into(),
        }
    }

    /// Processes a single job end to end. Never propagates adapter/handler
    /// failures as `Err` once a run has been loaded — those are folded into
    /// the run's own failure/retry handling per §7; `Err` here means a store
    /// or queue operation itself failed (the caller should redeliver).
    pub async fn process_job(&self, mut job: Job) -> Result<(), ExecutorError> {
        let span = tracing::info_span!("execute_job", worker_id = %self.worker_id, run_id = %job.run_id, node_id = %job.node_id, attempt = job.attempts);
        let _enter = span.enter();

        let Some(mut run) = self.store.get_run(&job.run_id).await? else {
            info!("run missing, discarding job");
            self.queue.complete(job).await?;
            return Ok(());
        };
        if run.status == RunStatus::Completed || run.status == RunStatus::Cancelled {
            info!(status = ?run.status, "run already terminal, discarding job");
            self.queue.complete(job).await?;
            return Ok(());
        }

        let Some(definition) = self.store.get_definition(&job.definition_id).await? else {
            self.fail_run(&mut run, "definition missing".to_string()).await?;
            self.queue.complete(job).await?;
            return Ok(());
        };

        let Some(node) = definition.node(&job.node_id).cloned() else {
            self.fail_run(&mut run, format!("node {} missing from definition", job.node_id)).await?;
            self.queue.complete(job).await?;
            return Ok(());
        };

        // Idempotent redelivery guard (§7 "at-least-once semantics"): a node
        // already recorded as completed/skipped/waiting never re-executes.
        if let Some(entry) = run.path_entry_mut(&node.id) {
            if matches!(entry.status, PathEntryStatus::Completed | PathEntryStatus::Skipped | PathEntryStatus::Waiting) {
                info!(status = ?entry.status, "node already resolved, discarding redelivered job");
                self.queue.complete(job).await?;
                return Ok(());
            }
            entry.status = PathEntryStatus::Running;
        } else {
            run.execution_path.push(ExecutionPathEntry {
                node_id: node.id.clone(),
                kind: node.config.kind_name().to_string(),
                label: node.label.clone(),
                status: PathEntryStatus::Running,
                scheduled_for: job.scheduled_for,
                completed_at: None,
                result: None,
                error: None,
            });
        }
        run.current_node_id = Some(node.id.clone());
        run = self.cas_save(run).await?;

        job.attempts += 1;
        job.last_attempt_at = Some(Utc::now());
        let attempt = job.attempts;
        let started_at = job.last_attempt_at.expect("just set");

        let timeout_seconds = node.execution_timeout_seconds.map(|t| t as u64).unwrap_or(self.default_execution_timeout_seconds);
        let input = HandlerInput { run: &run, node: &node, attempt, default_country_prefix: &self.default_country_prefix };

        let outcome = match self.registry.get(node.config.kind_name()) {
            Some(handler) => {
                match tokio::time::timeout(StdDuration::from_secs(timeout_seconds), handler.execute(&input)).await {
                    Ok(result) => result,
                    Err(_) => Err(AdapterError::Transient(format!("node execution timed out after {timeout_seconds}s"))),
                }
            }
            None => Err(AdapterError::InvalidInput(format!("no handler registered for kind {}", node.config.kind_name()))),
        };

        let duration_ms = (Utc::now() - started_at).num_milliseconds().max(0);

        match outcome {
            Ok(handler_outcome) => self.on_success(&mut run, &definition, &node, &job, handler_outcome, duration_ms).await?,
            Err(err) => self.on_failure(&mut run, &definition, &node, &mut job, err, duration_ms).await?,
        }

        Ok(())
    }

    async fn on_success(
        &self,
        run: &mut Run,
        definition: &WorkflowDefinition,
        node: &Node,
        job: &Job,
        outcome: HandlerOutcome,
        duration_ms: i64,
    ) -> Result<(), ExecutorError> {
        match outcome {
            HandlerOutcome::Completed { handle, result } => {
                if let Some(entry) = run.path_entry_mut(&node.id) {
                    entry.status = PathEntryStatus::Completed;
                    entry.completed_at = Some(Utc::now());
                    entry.result = Some(result.clone());
                }
                let mut previous: serde_json::Map<String, serde_json::Value> = run
                    .context
                    .get("previousResults")
                    .and_then(|v| v.as_object().cloned())
                    .unwrap_or_default();
                previous.insert(node.id.clone(), result);
                run.context.insert("previousResults".to_string(), serde_json::Value::Object(previous));

                self.log(run, node, LogStatus::Success, "node completed".to_string(), None, Some(duration_ms), job.attempts)
                    .await?;

                let successors = definition.successors(&node.id, handle.as_deref());
                self.schedule_successors(run, definition, &successors).await?;

                // `conditionWithTimeout` evaluates and completes immediately
                // like `condition`, but still arms a timeout job against its
                // own `timeout` handle (§4.2): if nothing re-evaluates the
                // node's truth within the window, the timeout branch fires
                // independently of whichever branch was just taken.
                if let NodeConfig::ConditionWithTimeout { timeout_seconds, timeout_handle, .. } = &node.config {
                    let timeout_at = Utc::now() + chrono::Duration::seconds(*timeout_seconds);
                    self.enqueue_timeout_job(run, definition, node, timeout_at, timeout_handle).await?;
                }

                // Ack this job before checking for outstanding work: the
                // job is still Pending/Processing in the store until this
                // completes, so `maybe_complete_run`'s "no outstanding jobs"
                // check would otherwise always see it and never let a
                // terminal node's run reach `Completed`.
                self.queue.complete(job.clone()).await?;
                self.maybe_complete_run(run, definition).await?;
            }
            HandlerOutcome::WaitingForReply(wait) => {
                if let Some(entry) = run.path_entry_mut(&node.id) {
                    entry.status = PathEntryStatus::Waiting;
                }
                run.status = RunStatus::WaitingForReply;
                let timeout_at = wait.timeout_at;
                run.waiting_for_reply = Some(wait);
                self.log(run, node, LogStatus::Waiting, "awaiting reply".to_string(), None, Some(duration_ms), job.attempts).await?;
                self.enqueue_timeout_job(run, definition, node, timeout_at, "response").await?;
                self.queue.complete(job.clone()).await?;
            }
            HandlerOutcome::WaitingForCall(wait) => {
                if let Some(entry) = run.path_entry_mut(&node.id) {
                    entry.status = PathEntryStatus::Waiting;
                }
                run.status = RunStatus::WaitingForCall;
                let timeout_at = wait.timeout_at;
                run.waiting_for_call = Some(wait);
                self.log(run, node, LogStatus::Waiting, "awaiting call outcome".to_string(), None, Some(duration_ms), job.attempts).await?;
                self.enqueue_timeout_job(run, definition, node, timeout_at, "call").await?;
                self.queue.complete(job.clone()).await?;
            }
            HandlerOutcome::WaitingForTask(wait) => {
                if let Some(entry) = run.path_entry_mut(&node.id) {
                    entry.status = PathEntryStatus::Waiting;
                }
                run.status = RunStatus::WaitingForTask;
                run.waiting_for_task = Some(wait);
                self.log(run, node, LogStatus::Waiting, "awaiting human task completion".to_string(), None, Some(duration_ms), job.attempts).await?;
                self.queue.complete(job.clone()).await?;
            }
        }

        *run = self.cas_save(run.clone()).await?;
        Ok(())
    }

    async fn on_failure(
        &self,
        run: &mut Run,
        definition: &WorkflowDefinition,
        node: &Node,
        job: &mut Job,
        err: AdapterError,
        duration_ms: i64,
    ) -> Result<(), ExecutorError> {
        let max_attempts = node.max_attempts.unwrap_or(self.retry.max_attempts).max(1);
        let retryable = err.is_transient() && job.attempts < max_attempts;

        warn!(error = %err, attempt = job.attempts, max_attempts, retryable, "node execution failed");
        self.log(run, node, LogStatus::Retrying, err.to_string(), Some(err.to_string()), Some(duration_ms), job.attempts).await?;

        if retryable {
            let delay = backoff_delay(job.attempts, self.retry.backoff_base_seconds, self.retry.backoff_jitter_pct);
            self.queue.retry(job.clone(), delay).await?;
            return Ok(());
        }

        // Retries exhausted (or the error was non-retryable): apply §7's
        // failure-path / skip-on-failure / hard-failure policy. A declared
        // failure path always wins over skip when both are configured.
        let failure_edges: Vec<Edge> = definition
            .edges
            .iter()
            .filter(|e| e.from == node.id && matches!(e.handle.as_deref(), Some("failure") | Some("error")))
            .cloned()
            .collect();

        if !failure_edges.is_empty() {
            if let Some(entry) = run.path_entry_mut(&node.id) {
                entry.status = PathEntryStatus::Failed;
                entry.error = Some(err.to_string());
                entry.completed_at = Some(Utc::now());
            }
            self.schedule_successors(run, definition, &failure_edges.iter().collect::<Vec<_>>()).await?;
            job.status = JobStatus::Failed;
            job.last_error = Some(err.to_string());
            self.store.update_job(job.clone()).await?;
            self.maybe_complete_run(run, definition).await?;
        } else if node.skip_on_failure {
            if let Some(entry) = run.path_entry_mut(&node.id) {
                entry.status = PathEntryStatus::Skipped;
                entry.error = Some(err.to_string());
                entry.completed_at = Some(Utc::now());
            }
            self.log(run, node, LogStatus::Skipped, "node skipped after exhausting retries".to_string(), Some(err.to_string()), Some(duration_ms), job.attempts).await?;
            let successors = definition.successors(&node.id, None);
            self.schedule_successors(run, definition, &successors).await?;
            job.status = JobStatus::Failed;
            job.last_error = Some(err.to_string());
            self.store.update_job(job.clone()).await?;
            self.maybe_complete_run(run, definition).await?;
        } else {
            if let Some(entry) = run.path_entry_mut(&node.id) {
                entry.status = PathEntryStatus::Failed;
                entry.error = Some(err.to_string());
                entry.completed_at = Some(Utc::now());
            }
            run.status = RunStatus::Failed;
            run.error = Some(err.to_string());
            run.completed_at = Some(Utc::now());
            self.log(run, node, LogStatus::DeadLetter, "run failed, job dead-lettered".to_string(), Some(err.to_string()), Some(duration_ms), job.attempts).await?;
            self.store.increment_failure_count(&definition.id).await?;
            if let Some(notifier) = &self.admin_notifier {
                notifier
                    .notify(
                        &run.tenant_id,
                        AdminNotification {
                            definition_id: definition.id.clone(),
                            lead_id: run.lead_id.clone(),
                            node_id: node.id.clone(),
                            error: err.to_string(),
                            attempts: job.attempts,
                            run_id: run.id.clone(),
                            timestamp: Utc::now(),
                        },
                    )
                    .await;
            }
            self.queue.dead_letter(job.clone(), err.to_string()).await?;
        }

        *run = self.cas_save(run.clone()).await?;
        Ok(())
    }

    /// Enqueues each successor edge's target node as a job, respecting a
    /// delay-node target's own delay (§4.2 "delay" and tie-break fan-out
    /// rule: all matching edges are enqueued).
    async fn schedule_successors(&self, run: &mut Run, definition: &WorkflowDefinition, edges: &[&Edge]) -> Result<(), ExecutorError> {
        for edge in edges {
            let Some(next) = definition.node(&edge.to) else {
                error!(node_id = %edge.to, "edge references unknown node");
                continue;
            };
            let delay = next.config.initial_delay_seconds();
            let scheduled = scheduled_for(delay);
            run.execution_path.push(ExecutionPathEntry {
                node_id: next.id.clone(),
                kind: next.config.kind_name().to_string(),
                label: next.label.clone(),
                status: PathEntryStatus::Pending,
                scheduled_for: scheduled,
                completed_at: None,
                result: None,
                error: None,
            });
            let job = Job {
                id: uuid::Uuid::new_v4().to_string(),
                run_id: run.id.clone(),
                definition_id: definition.id.clone(),
                lead_id: run.lead_id.clone(),
                tenant_id: run.tenant_id.clone(),
                node_id: next.id.clone(),
                kind: next.config.kind_name().to_string(),
                config: serde_json::to_value(&next.config).unwrap_or(serde_json::Value::Null),
                queue: JobQueueKind::Execute,
                status: JobStatus::Pending,
                scheduled_for: scheduled,
                attempts: 0,
                max_attempts: next.max_attempts.unwrap_or(self.retry.max_attempts),
                last_attempt_at: None,
                last_error: None,
                result: None,
                completed_at: None,
                created_at: Utc::now(),
            };
            self.queue.enqueue(job).await?;
        }
        Ok(())
    }

    async fn enqueue_timeout_job(&self, run: &Run, definition: &WorkflowDefinition, node: &Node, timeout_at: chrono::DateTime<Utc>, kind: &str) -> Result<(), ExecutorError> {
        let delay = (timeout_at - Utc::now()).num_seconds().max(0);
        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run.id.clone(),
            definition_id: definition.id.clone(),
            lead_id: run.lead_id.clone(),
            tenant_id: run.tenant_id.clone(),
            node_id: node.id.clone(),
            kind: format!("timeout:{kind}"),
            config: serde_json::Value::Null,
            queue: JobQueueKind::Timeout,
            status: JobStatus::Pending,
            scheduled_for: scheduled_for(delay),
            attempts: 0,
            max_attempts: 1,
            last_attempt_at: None,
            last_error: None,
            result: None,
            completed_at: None,
            created_at: Utc::now(),
        };
        self.queue.enqueue(job).await?;
        Ok(())
    }

    /// If there are no pending/processing jobs left for the run, it's done
    /// (§4.2 "Post-execution"): mark `completed` and bump the definition's
    /// `successCount`.
    async fn maybe_complete_run(&self, run: &mut Run, definition: &WorkflowDefinition) -> Result<(), ExecutorError> {
        if run.status.is_waiting() {
            return Ok(());
        }
        let jobs = self.store.jobs_for_run(&run.id).await?;
        let outstanding = jobs.iter().any(|j| matches!(j.status, JobStatus::Pending | JobStatus::Processing | JobStatus::Waiting));
        if !outstanding {
            run.status = RunStatus::Completed;
            run.completed_at = Some(Utc::now());
            run.current_node_id = None;
            self.store.increment_success_count(&definition.id).await?;
        }
        Ok(())
    }

    async fn fail_run(&self, run: &mut Run, reason: String) -> Result<(), ExecutorError> {
        run.status = RunStatus::Failed;
        run.error = Some(reason);
        run.completed_at = Some(Utc::now());
        *run = self.cas_save(run.clone()).await?;
        Ok(())
    }

    /// Compare-and-set write with a bounded retry loop absorbing lost CAS
    /// races from concurrent workers (§5 "losers retry their read-modify-
    /// write cycle"). Our run mutations above are computed against an
    /// already-loaded snapshot, so on conflict we simply reattempt the save;
    /// the caller is the sole owner of the in-flight semantic change.
    async fn cas_save(&self, run: Run) -> Result<Run, ExecutorError> {
        match self.store.cas_update_run(run.clone()).await {
            Ok(saved) => Ok(saved),
            Err(StoreError::VersionConflict { .. }) => {
                warn!(run_id = %run.id, "CAS conflict saving run, retrying against latest version");
                let Some(latest) = self.store.get_run(&run.id).await? else {
                    return Err(ExecutorError::Invariant(format!("run {} disappeared mid-update", run.id)));
                };
                Ok(self.store.cas_update_run(latest).await?)
            }
            Err(other) => Err(other.into()),
        }
    }

    async fn log(
        &self,
        run: &Run,
        node: &Node,
        status: LogStatus,
        message: String,
        error: Option<String>,
        duration_ms: Option<i64>,
        attempt: u32,
    ) -> Result<(), ExecutorError> {
        self.store
            .append_log_entry(ExecutionLogEntry {
                tenant_id: run.tenant_id.clone(),
                run_id: run.id.clone(),
                node_id: node.id.clone(),
                node_kind: node.config.kind_name().to_string(),
                label: node.label.clone(),
                status,
                message,
                error,
                duration_ms,
                attempt,
                worker_id: self.worker_id.clone(),
                metadata: serde_json::Value::Null,
                timestamp: Utc::now(),
            })
            .await?;
        Ok(())
    }
}

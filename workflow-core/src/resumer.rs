//! The Resumer (§4.3): reentry points invoked by webhooks/callbacks
//! (messaging reply, call outcome, human task completion) and by the
//! timeout-queue jobs, matching the callback to a waiting run and enqueueing
//! successor nodes along the correct branch.

use std::sync::Arc;

use chrono::Utc;
use regex::RegexBuilder;
use tracing::{info, warn};

use crate::error::{ExecutorError, StoreError};
use crate::model::{
    Edge, ExecutionPathEntry, ExpectedResponseKind, Job, JobQueueKind, JobStatus, LogStatus,
    PathEntryStatus, Run, RunId, RunStatus, TenantId, WorkflowDefinition,
};
use crate::queue::{scheduled_for, JobQueue};
use crate::store::StateStore;

/// A reply decomposed into its neutral shape (§4.3). Kinds beyond `text` and
/// `button` carry no further matching semantics beyond "any".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyKind {
    Text,
    Button,
    InteractiveButton,
    InteractiveList,
    Media,
    Location,
    Reaction,
}

#[derive(Debug, Clone)]
pub struct IncomingReply {
    pub kind: ReplyKind,
    pub text: Option<String>,
    pub button_payload: Option<String>,
    pub button_text: Option<String>,
}

/// Outcome of one resume attempt, for callers (webhook handlers) to decide
/// what to respond with; every variant is still a "handled" result, since
/// §6 requires webhooks to ack even when nothing matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeOutcome {
    Resumed { run_id: RunId, handle: String },
    /// Acknowledged but no match was found, or the matched run was no
    /// longer actually waiting (§4.3 voice "if still in progress, acknowledge
    /// and return").
    NoMatch,
}

pub struct Resumer {
    store: Arc<dyn StateStore>,
    queue: Arc<dyn JobQueue>,
}

impl Resumer {
    pub fn new(store: Arc<dyn StateStore>, queue: Arc<dyn JobQueue>) -> Self {
        Resumer { store, queue }
    }

    /// Messaging reply entry point (§4.3 "Messaging reply"). `normalized_phone`
    /// is the caller's already-normalized `from` number.
    pub async fn handle_reply(
        &self,
        tenant_id: &TenantId,
        normalized_phone: &str,
        reply: &IncomingReply,
    ) -> Result<ResumeOutcome, ExecutorError> {
        let candidates = self.store.find_waiting_for_reply_by_phone(tenant_id, normalized_phone).await?;
        let Some(mut run) = candidates.into_iter().next() else {
            info!(tenant_id = %tenant_id, phone = %normalized_phone, "no waiting run found for reply");
            return Ok(ResumeOutcome::NoMatch);
        };

        let Some(wait) = run.waiting_for_reply.clone() else {
            return Ok(ResumeOutcome::NoMatch);
        };

        let mut handle: Option<String> = None;
        for expected in &wait.expected_responses {
            let matched = match expected.kind {
                ExpectedResponseKind::Any => true,
                ExpectedResponseKind::Button => {
                    let want = expected.value.as_deref().unwrap_or_default();
                    reply.button_payload.as_deref() == Some(want)
                        || reply.button_text.as_deref().map(|t| t.eq_ignore_ascii_case(want)).unwrap_or(false)
                }
                ExpectedResponseKind::TextRegex => match (&expected.value, &reply.text) {
                    (Some(pattern), Some(text)) => RegexBuilder::new(pattern)
                        .case_insensitive(true)
                        .build()
                        .map(|re| re.is_match(text))
                        .unwrap_or(false),
                    _ => false,
                },
            };
            if matched {
                handle = Some(expected.next_handle.clone());
                break;
            }
        }
        let handle = handle.unwrap_or_else(|| "default".to_string());

        run.context.insert(
            "lastReply".to_string(),
            serde_json::json!({
                "text": reply.text,
                "buttonPayload": reply.button_payload,
                "buttonText": reply.button_text,
            }),
        );
        run.context.insert("lastContactAt".to_string(), serde_json::json!(Utc::now()));

        self.resume_common(&mut run, &wait.node_id, &handle, "messagingReply").await
    }

    /// Voice call outcome entry point (§4.3 "Voice call outcome").
    pub async fn handle_call_outcome(
        &self,
        provider_call_id: Option<&str>,
        provider_conversation_id: Option<&str>,
        callback_run_id: Option<&RunId>,
        status: &str,
        analysis: Option<&serde_json::Value>,
    ) -> Result<ResumeOutcome, ExecutorError> {
        let Some(mut run) = self
            .store
            .find_waiting_for_call(provider_call_id, provider_conversation_id, callback_run_id)
            .await?
        else {
            info!(?provider_call_id, ?provider_conversation_id, "no waiting run found for call outcome");
            return Ok(ResumeOutcome::NoMatch);
        };

        let Some(wait) = run.waiting_for_call.clone() else {
            // Confirmed not actually waiting: acknowledge and return (§4.3).
            return Ok(ResumeOutcome::NoMatch);
        };

        let outcome = derive_call_outcome(status, analysis);
        let handle = wait
            .expected_outcomes
            .iter()
            .find(|o| o.outcome == outcome)
            .map(|o| o.next_handle.clone())
            .unwrap_or_else(|| default_voice_outcome_map(&outcome).to_string());

        run.context.insert("lastCallOutcome".to_string(), serde_json::Value::String(outcome));

        self.resume_common(&mut run, &wait.node_id, &handle, "callOutcome").await
    }

    /// Human task completion entry point (§4.3 "Human task completion").
    pub async fn handle_task_completion(
        &self,
        task_id: &str,
        completion_result: &str,
        notes: Option<&str>,
    ) -> Result<ResumeOutcome, ExecutorError> {
        let Some(mut run) = self.store.find_waiting_for_task(task_id).await? else {
            info!(task_id, "no waiting run found for task completion");
            return Ok(ResumeOutcome::NoMatch);
        };
        let Some(wait) = run.waiting_for_task.clone() else {
            return Ok(ResumeOutcome::NoMatch);
        };

        let handle = match completion_result {
            "success" => "success",
            "failed" => "failed",
            "rescheduled" => "rescheduled",
            "no_answer" => "no_answer",
            _ => "completed",
        }
        .to_string();

        if let Some(notes) = notes {
            run.context.insert("lastTaskNotes".to_string(), serde_json::Value::String(notes.to_string()));
        }

        self.resume_common(&mut run, &wait.node_id, &handle, "taskCompletion").await
    }

    /// Response/call-timeout entry point, invoked by Timeout-queue jobs
    /// (§4.3 "Response timeout / call timeout").
    pub async fn handle_timeout(&self, run_id: &RunId, node_id: &str) -> Result<ResumeOutcome, ExecutorError> {
        let Some(mut run) = self.store.get_run(run_id).await? else {
            return Ok(ResumeOutcome::NoMatch);
        };
        if !run.is_waiting_on(node_id) {
            // Already resumed by a real reply/outcome; the timeout job is a
            // stale redelivery (§7 "at-least-once semantics").
            return Ok(ResumeOutcome::NoMatch);
        }
        let handle = run
            .waiting_for_reply
            .as_ref()
            .filter(|w| w.node_id == node_id)
            .map(|w| w.timeout_handle.clone())
            .or_else(|| {
                run.waiting_for_call.as_ref().filter(|w| w.node_id == node_id).map(|w| w.timeout_handle.clone())
            })
            .unwrap_or_else(|| "timeout".to_string());

        self.resume_common(&mut run, node_id, &handle, "timeout").await
    }

    /// Shared resume mechanics (§4.3 "Common resume steps"): mark the
    /// waiting path entry completed, clear the wait record, set the run
    /// running, schedule successors, or complete the run if none exist.
    async fn resume_common(
        &self,
        run: &mut Run,
        node_id: &str,
        handle: &str,
        resume_kind: &str,
    ) -> Result<ResumeOutcome, ExecutorError> {
        if !run.is_waiting_on(node_id) {
            // Redelivered/duplicate webhook after the wait record was already
            // cleared by a prior resume: idempotent no-op (§8 round-trip law).
            return Ok(ResumeOutcome::NoMatch);
        }

        let definition = self
            .store
            .get_definition(&run.definition_id)
            .await?
            .ok_or_else(|| ExecutorError::Invariant(format!("definition {} missing for run {}", run.definition_id, run.id)))?;

        if let Some(entry) = run.path_entry_mut(node_id) {
            entry.status = PathEntryStatus::Completed;
            entry.completed_at = Some(Utc::now());
            entry.result = Some(serde_json::json!({ "resumedVia": resume_kind, "handle": handle }));
        }
        run.clear_waits();
        run.status = RunStatus::Running;
        run.current_node_id = Some(node_id.to_string());

        // A real reply/call/task callback resumes the run ahead of its armed
        // timeout job; cancel that job so it doesn't linger Pending forever
        // (it would otherwise count as outstanding work below and, if ever
        // claimed, the wait-record check makes it a no-op anyway, but an
        // uncancelled row is still a leak worth cleaning up here).
        self.cancel_pending_wait_timeout(run, node_id).await?;

        let successors = definition.successors(node_id, Some(handle));
        self.schedule_successors(run, &definition, &successors).await?;

        if successors.is_empty() {
            let jobs = self.store.jobs_for_run(&run.id).await?;
            let outstanding = jobs
                .iter()
                .any(|j| matches!(j.status, JobStatus::Pending | JobStatus::Processing | JobStatus::Waiting));
            if !outstanding {
                run.status = RunStatus::Completed;
                run.completed_at = Some(Utc::now());
                self.store.increment_success_count(&definition.id).await?;
            }
        }

        self.cas_save(run.clone()).await.map(|saved| {
            *run = saved;
        })?;

        Ok(ResumeOutcome::Resumed { run_id: run.id.clone(), handle: handle.to_string() })
    }

    /// Cancels the still-pending Timeout-queue job armed for `node_id` on
    /// this run, if one exists. Scoped to `(run_id, node_id, Timeout queue,
    /// Pending)` so it never touches the successor job just enqueued above
    /// or jobs belonging to other nodes.
    async fn cancel_pending_wait_timeout(&self, run: &Run, node_id: &str) -> Result<(), ExecutorError> {
        let jobs = self.store.jobs_for_run(&run.id).await?;
        for mut job in jobs {
            if job.node_id == node_id && job.queue == JobQueueKind::Timeout && job.status == JobStatus::Pending {
                job.status = JobStatus::Cancelled;
                self.store.update_job(job).await?;
            }
        }
        Ok(())
    }

    async fn schedule_successors(&self, run: &mut Run, definition: &WorkflowDefinition, edges: &[&Edge]) -> Result<(), ExecutorError> {
        for edge in edges {
            let Some(next) = definition.node(&edge.to) else {
                warn!(node_id = %edge.to, "edge references unknown node");
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
                max_attempts: next.max_attempts.unwrap_or(3),
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

    /// Mirrors `Executor::cas_save`'s lost-race retry (§5).
    async fn cas_save(&self, run: Run) -> Result<Run, ExecutorError> {
        match self.store.cas_update_run(run.clone()).await {
            Ok(saved) => Ok(saved),
            Err(StoreError::VersionConflict { .. }) => {
                let Some(latest) = self.store.get_run(&run.id).await? else {
                    return Err(ExecutorError::Invariant(format!("run {} disappeared mid-update", run.id)));
                };
                Ok(self.store.cas_update_run(latest).await?)
            }
            Err(other) => Err(other.into()),
        }
    }
}

/// Derives the outcome literal from a call-completion callback (§4.3).
fn derive_call_outcome(status: &str, analysis: Option<&serde_json::Value>) -> String {
    match status {
        "no_answer" | "busy" | "failed" | "voicemail" => return status.to_string(),
        _ => {}
    }
    if matches!(status, "completed" | "done") {
        if let Some(analysis) = analysis {
            let flag = |key: &str| {
                analysis
                    .get("evaluation")
                    .and_then(|e| e.get(key))
                    .or_else(|| analysis.get("evaluation_criteria_results").and_then(|e| e.get(key)))
                    .map(truthy)
                    .unwrap_or(false)
            };
            if flag("interested") {
                return "interested".to_string();
            }
            if flag("not_interested") {
                return "not_interested".to_string();
            }
            if flag("callback_requested") {
                return "callback_requested".to_string();
            }
        }
        return "answered".to_string();
    }
    "answered".to_string()
}

/// Analysis flags may arrive as JSON booleans or as the string `"true"`.
fn truthy(v: &serde_json::Value) -> bool {
    v.as_bool().unwrap_or(false) || v.as_str() == Some("true")
}

/// Glossary "Default voice-outcome map", used when a node's
/// `expectedOutcomes` doesn't name the derived outcome.
fn default_voice_outcome_map(outcome: &str) -> &'static str {
    match outcome {
        "interested" => "interested",
        "not_interested" => "not_interested",
        "callback_requested" => "callback",
        "answered" => "answered",
        "no_answer" => "no_answer",
        "voicemail" => "voicemail",
        "busy" => "busy",
        "failed" => "failed",
        _ => "default",
    }
}

/// Parses the neutral webhook reply shape (§6 `POST /webhook/messaging/reply`)
/// into an `IncomingReply`.
pub fn decompose_reply(kind: &str, text: Option<String>, button_payload: Option<String>, button_text: Option<String>) -> IncomingReply {
    let kind = match kind {
        "button" => ReplyKind::Button,
        "interactiveButton" => ReplyKind::InteractiveButton,
        "interactiveList" => ReplyKind::InteractiveList,
        "media" => ReplyKind::Media,
        "location" => ReplyKind::Location,
        "reaction" => ReplyKind::Reaction,
        _ => ReplyKind::Text,
    };
    IncomingReply { kind, text, button_payload, button_text }
}

//! The Trigger Matcher (§4.1): translates a domain event into zero or more
//! new Runs.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::model::{
    DomainEvent, EventKind, ExecutionPathEntry, Job, JobQueueKind, JobStatus, LeadView, PathEntryStatus,
    Run, RunStatus, TriggerFilter, TriggerType, WorkflowDefinition,
};
use crate::queue::{scheduled_for, JobQueue};
use crate::store::StateStore;

/// Why a candidate definition was skipped (§4.1 step 3), kept for
/// observability/logging rather than surfaced to callers as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    FilterMismatch,
    RunOnce,
    Duplicate,
    Cooldown,
}

impl SkipReason {
    fn as_str(&self) -> &'static str {
        match self {
            SkipReason::FilterMismatch => "filterMismatch",
            SkipReason::RunOnce => "runOnce",
            SkipReason::Duplicate => "duplicate",
            SkipReason::Cooldown => "cooldown",
        }
    }
}

pub struct MatchOutcome {
    pub created_run_ids: Vec<String>,
    pub skips: Vec<(String, SkipReason)>,
    pub errors: Vec<(String, String)>,
}

pub struct TriggerMatcher {
    store: Arc<dyn StateStore>,
    queue: Arc<dyn JobQueue>,
}

impl TriggerMatcher {
    pub fn new(store: Arc<dyn StateStore>, queue: Arc<dyn JobQueue>) -> Self {
        TriggerMatcher { store, queue }
    }

    /// Event-kind → trigger-type mapping, honoring the `siteVisit.scheduled`
    /// alias (§6 backward-compat hooks).
    fn event_trigger_type(event: &DomainEvent) -> TriggerType {
        match event.kind {
            EventKind::LeadCreated => TriggerType::LeadCreated,
            EventKind::LeadUpdated => TriggerType::LeadUpdated,
            EventKind::AppointmentScheduled => TriggerType::AppointmentScheduled,
            EventKind::Manual => TriggerType::Manual,
        }
    }

    pub async fn handle_event(&self, event: DomainEvent) -> Result<MatchOutcome, StoreError> {
        if event.payload.is_null() {
            info!(tenant_id = %event.tenant_id, lead_id = %event.lead_id, "lead missing at event time, discarding");
            return Ok(MatchOutcome { created_run_ids: vec![], skips: vec![], errors: vec![] });
        }

        let candidates = if let Some(forced) = &event.force_definition_id {
            match self.store.get_definition(forced).await? {
                Some(def) if def.is_active => vec![def],
                _ => vec![],
            }
        } else {
            self.store.list_candidate_definitions(&event.tenant_id, Self::event_trigger_type(&event)).await?
        };

        let mut outcome = MatchOutcome { created_run_ids: vec![], skips: vec![], errors: vec![] };
        for definition in candidates {
            match self.try_match_one(&event, &definition).await {
                Ok(Some(run_id)) => outcome.created_run_ids.push(run_id),
                Ok(None) => {}
                Err((reason, skipped)) => {
                    if skipped {
                        outcome.skips.push((definition.id.clone(), reason_from_str(&reason)));
                    } else {
                        warn!(definition_id = %definition.id, error = %reason, "trigger match failed for candidate");
                        outcome.errors.push((definition.id.clone(), reason));
                    }
                }
            }
        }
        Ok(outcome)
    }

    /// Evaluates one candidate definition against the event. Returns the new
    /// run id on success, or `(message, is_skip)` otherwise. A single
    /// candidate's failure must never prevent others from being evaluated
    /// (§4.1 "Failure mode"), so callers always continue the loop.
    async fn try_match_one(
        &self,
        event: &DomainEvent,
        definition: &WorkflowDefinition,
    ) -> Result<Option<String>, (String, bool)> {
        let lead = LeadView::new(&event.payload);

        if event.force_definition_id.is_none() {
            let filter_ok = match &definition.trigger_filter {
                None => true,
                Some(filter) => evaluate_trigger_filter(filter, &lead, event.changes.as_ref()),
            };
            if !filter_ok {
                return Err(("filterMismatch".to_string(), true));
            }
        }

        let prior_runs = self
            .store
            .runs_for_definition_lead(&definition.id, &event.lead_id)
            .await
            .map_err(|e| (e.to_string(), false))?;

        if definition.run_once_per_lead && !prior_runs.is_empty() {
            return Err(("runOnce".to_string(), true));
        }

        if definition.prevent_duplicates && prior_runs.iter().any(|r| r.status.is_active()) {
            return Err(("duplicate".to_string(), true));
        }

        if definition.cooldown_minutes > 0 {
            let window_start = Utc::now() - chrono::Duration::minutes(definition.cooldown_minutes);
            if prior_runs.iter().any(|r| r.started_at >= window_start) {
                return Err(("cooldown".to_string(), true));
            }
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let mut run = Run::new(run_id.clone(), event.tenant_id.clone(), definition.id.clone(), event.lead_id.clone(), now);
        run.status = RunStatus::Running;
        run.context.insert("lead".to_string(), event.payload.clone());
        if let Some(changes) = &event.changes {
            run.context.insert("changes".to_string(), changes.clone());
        }
        if let Some(appointment) = &event.appointment {
            run.context.insert("appointment".to_string(), appointment.clone());
        }

        let trigger_node = definition.trigger_node().ok_or_else(|| ("no trigger node on definition".to_string(), false))?;
        let successors = definition.successors(&trigger_node.id, None);
        if successors.is_empty() {
            run.status = RunStatus::Completed;
            run.completed_at = Some(now);
        }

        for edge in &successors {
            let Some(node) = definition.node(&edge.to) else { continue };
            let delay_seconds = node.config.initial_delay_seconds();
            let scheduled = scheduled_for(delay_seconds);
            run.execution_path.push(ExecutionPathEntry {
                node_id: node.id.clone(),
                kind: node.config.kind_name().to_string(),
                label: node.label.clone(),
                status: PathEntryStatus::Pending,
                scheduled_for: scheduled,
                completed_at: None,
                result: None,
                error: None,
            });
        }

        self.store.create_run(run).await.map_err(|e| (e.to_string(), false))?;

        for edge in &successors {
            let Some(node) = definition.node(&edge.to) else { continue };
            let delay_seconds = node.config.initial_delay_seconds();
            let job = Job {
                id: uuid::Uuid::new_v4().to_string(),
                run_id: run_id.clone(),
                definition_id: definition.id.clone(),
                lead_id: event.lead_id.clone(),
                tenant_id: event.tenant_id.clone(),
                node_id: node.id.clone(),
                kind: node.config.kind_name().to_string(),
                config: serde_json::to_value(&node.config).unwrap_or(serde_json::Value::Null),
                queue: JobQueueKind::Execute,
                status: JobStatus::Pending,
                scheduled_for: scheduled_for(delay_seconds),
                attempts: 0,
                max_attempts: node.max_attempts.unwrap_or(3),
                last_attempt_at: None,
                last_error: None,
                result: None,
                completed_at: None,
                created_at: now,
            };
            self.queue.enqueue(job).await.map_err(|e| (e.to_string(), false))?;
        }

        self.store.increment_runs_count(&definition.id, now).await.map_err(|e| (e.to_string(), false))?;

        Ok(Some(run_id))
    }
}

fn reason_from_str(s: &str) -> SkipReason {
    match s {
        "runOnce" => SkipReason::RunOnce,
        "duplicate" => SkipReason::Duplicate,
        "cooldown" => SkipReason::Cooldown,
        _ => SkipReason::FilterMismatch,
    }
}

/// Evaluates a `TriggerFilter` against a lead snapshot: every populated
/// condition is AND-combined (§4.1 step a).
pub fn evaluate_trigger_filter(filter: &TriggerFilter, lead: &LeadView, changes: Option<&serde_json::Value>) -> bool {
    if let Some(sources) = &filter.source_in {
        match lead.source() {
            Some(s) if sources.contains(s) => {}
            _ => return false,
        }
    }
    if let Some(min) = filter.budget_min {
        match lead.budget() {
            Some(b) if b >= min => {}
            _ => return false,
        }
    }
    if let Some(max) = filter.budget_max {
        match lead.budget() {
            Some(b) if b <= max => {}
            _ => return false,
        }
    }
    if let Some(categories) = filter.effective_categories() {
        match lead.category() {
            Some(c) if categories.contains(c) => {}
            _ => return false,
        }
    }
    if let Some(needles) = &filter.location_contains_any_of {
        match lead.location() {
            Some(loc) => {
                let loc_lower = loc.to_lowercase();
                if !needles.iter().any(|n| loc_lower.contains(&n.to_lowercase())) {
                    return false;
                }
            }
            None => return false,
        }
    }
    if filter.status_from.is_some() || filter.status_to.is_some() {
        let (from, to) = changes
            .and_then(|c| c.get("status"))
            .map(|s| (s.get("from").and_then(|v| v.as_str()), s.get("to").and_then(|v| v.as_str())))
            .unwrap_or((None, None));
        if let Some(want_from) = &filter.status_from {
            if from != Some(want_from.as_str()) {
                return false;
            }
        }
        if let Some(want_to) = &filter.status_to {
            if to != Some(want_to.as_str()) {
                return false;
            }
        }
    }
    true
}

//! End-to-end scenario tests against the in-memory `testing::Harness`,
//! mirroring the canonical walkthroughs: new-lead nurture, branching on a
//! button reply, an AI-call outcome branch, retry-then-dead-letter, cooldown
//! suppression, and stuck-run reclaim.

use std::collections::HashMap;

use workflow_core::model::{
    DefinitionStats, DelayUnit, DomainEvent, Edge, EventKind, ExpectedOutcome, ExpectedResponse,
    ExpectedResponseKind, Job, JobStatus, Node, NodeConfig, RunStatus, TriggerType,
    WorkflowDefinition,
};
use workflow_core::testing::Harness;

fn lead(phone: &str) -> serde_json::Value {
    serde_json::json!({ "phone": phone, "source": "zillow", "budget": 500_000, "category": "condo" })
}

fn node(id: &str, label: &str, config: NodeConfig) -> Node {
    Node { id: id.to_string(), label: label.to_string(), config, execution_timeout_seconds: None, max_attempts: None, skip_on_failure: false }
}

fn edge(from: &str, to: &str, handle: Option<&str>) -> Edge {
    Edge { from: from.to_string(), to: to.to_string(), handle: handle.map(str::to_string) }
}

async fn pending_job_for(harness: &Harness, run_id: &str, node_id: &str) -> Job {
    use workflow_core::store::StateStore;
    harness
        .store
        .jobs_for_run(&run_id.to_string())
        .await
        .unwrap()
        .into_iter()
        .find(|j| j.node_id == node_id && j.status == JobStatus::Pending)
        .unwrap_or_else(|| panic!("no pending job for node {node_id} on run {run_id}"))
}

/// S1: new-lead nurture happy path, plus cooldown suppression on replay.
#[tokio::test]
async fn s1_new_lead_nurture_happy_path_then_cooldown() {
    let harness = Harness::new();

    let definition = WorkflowDefinition {
        id: "def-s1".to_string(),
        tenant_id: "T1".to_string(),
        name: "new lead nurture".to_string(),
        trigger_type: TriggerType::LeadCreated,
        trigger_filter: None,
        nodes: vec![
            node("trigger", "trigger", NodeConfig::Trigger),
            node(
                "a",
                "welcome message",
                NodeConfig::ActionMessaging {
                    channel: "whatsapp".to_string(),
                    template_id: Some("welcome_v1".to_string()),
                    variables: HashMap::new(),
                    body: None,
                    buttons: vec![],
                },
            ),
            node("b", "wait a day", NodeConfig::Delay { duration: 24, unit: DelayUnit::Hours }),
            node(
                "c",
                "followup",
                NodeConfig::ActionMessagingWithResponse {
                    channel: "whatsapp".to_string(),
                    template_id: Some("followup_buttons".to_string()),
                    variables: HashMap::new(),
                    body: None,
                    buttons: vec!["Interested".to_string(), "NotNow".to_string(), "Unsubscribe".to_string()],
                    expected_responses: vec![
                        ExpectedResponse { kind: ExpectedResponseKind::Button, value: Some("Interested".to_string()), next_handle: "interested".to_string() },
                        ExpectedResponse { kind: ExpectedResponseKind::Button, value: Some("NotNow".to_string()), next_handle: "notNow".to_string() },
                        ExpectedResponse { kind: ExpectedResponseKind::Button, value: Some("Unsubscribe".to_string()), next_handle: "unsubscribe".to_string() },
                    ],
                    timeout_seconds: 48 * 3600,
                    timeout_handle: "timeout".to_string(),
                },
            ),
            node("d", "call back", NodeConfig::ActionHumanTask { task_kind: "call_back".to_string(), due_in_seconds: 3600, assignment: None, timeout_seconds: None, timeout_handle: "timeout".to_string() }),
            node("e", "not now noop", NodeConfig::ActionEmail { subject: "noted".to_string(), body: "ok".to_string() }),
            node("f", "unsubscribed noop", NodeConfig::ActionEmail { subject: "bye".to_string(), body: "ok".to_string() }),
            node("g", "gave up noop", NodeConfig::ActionEmail { subject: "timeout".to_string(), body: "ok".to_string() }),
        ],
        edges: vec![
            edge("trigger", "a", None),
            edge("a", "b", None),
            edge("b", "c", None),
            edge("c", "d", Some("interested")),
            edge("c", "e", Some("notNow")),
            edge("c", "f", Some("unsubscribe")),
            edge("c", "g", Some("timeout")),
        ],
        prevent_duplicates: true,
        run_once_per_lead: false,
        cooldown_minutes: 60,
        is_active: true,
        stats: DefinitionStats::default(),
    };
    harness.store.save_definition(definition).await.unwrap();

    let matcher = harness.trigger_matcher();
    let event = DomainEvent {
        kind: EventKind::LeadCreated,
        tenant_id: "T1".to_string(),
        lead_id: "L1".to_string(),
        payload: lead("5551234"),
        changes: None,
        appointment: None,
        force_definition_id: None,
        occurred_at: chrono::Utc::now(),
    };
    let outcome = matcher.handle_event(event.clone()).await.unwrap();
    assert_eq!(outcome.created_run_ids.len(), 1);
    let run_id = outcome.created_run_ids[0].clone();

    let executor = harness.executor("worker-1");

    // node a (messaging) completes and schedules b (delay).
    let job_a = pending_job_for(&harness, &run_id, "a").await;
    executor.process_job(job_a).await.unwrap();
    assert_eq!(harness.messaging.sent.lock().unwrap().len(), 1);

    // node b (delay) completes immediately regardless of its scheduled time
    // in this harness: process_job does not itself gate on scheduledFor.
    let job_b = pending_job_for(&harness, &run_id, "b").await;
    executor.process_job(job_b).await.unwrap();

    // node c (messagingWithResponse) sends and parks the run waiting for a reply.
    let job_c = pending_job_for(&harness, &run_id, "c").await;
    executor.process_job(job_c).await.unwrap();
    assert_eq!(harness.messaging.sent.lock().unwrap().len(), 2);

    use workflow_core::store::StateStore;
    let run = harness.store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::WaitingForReply);
    assert!(run.waiting_for_reply.is_some());

    // Replaying the trigger event within the cooldown window must not create
    // a second run.
    let replay = matcher.handle_event(event).await.unwrap();
    assert!(replay.created_run_ids.is_empty());
    assert_eq!(replay.skips.len(), 1);
}

/// S2: branching on a button reply, then completing the resulting human task.
#[tokio::test]
async fn s2_branch_on_button_then_task_completion() {
    let harness = Harness::new();

    let definition = WorkflowDefinition {
        id: "def-s2".to_string(),
        tenant_id: "T1".to_string(),
        name: "branch on button".to_string(),
        trigger_type: TriggerType::LeadCreated,
        trigger_filter: None,
        nodes: vec![
            node("trigger", "trigger", NodeConfig::Trigger),
            node(
                "c",
                "followup",
                NodeConfig::ActionMessagingWithResponse {
                    channel: "whatsapp".to_string(),
                    template_id: Some("followup_buttons".to_string()),
                    variables: HashMap::new(),
                    body: None,
                    buttons: vec!["Interested".to_string()],
                    expected_responses: vec![ExpectedResponse {
                        kind: ExpectedResponseKind::Button,
                        value: Some("Interested".to_string()),
                        next_handle: "interested".to_string(),
                    }],
                    timeout_seconds: 3600,
                    timeout_handle: "timeout".to_string(),
                },
            ),
            node("d", "call back", NodeConfig::ActionHumanTask { task_kind: "call_back".to_string(), due_in_seconds: 3600, assignment: None, timeout_seconds: None, timeout_handle: "timeout".to_string() }),
        ],
        edges: vec![edge("trigger", "c", None), edge("c", "d", Some("interested"))],
        prevent_duplicates: false,
        run_once_per_lead: false,
        cooldown_minutes: 0,
        is_active: true,
        stats: DefinitionStats::default(),
    };
    harness.store.save_definition(definition).await.unwrap();

    let matcher = harness.trigger_matcher();
    let outcome = matcher
        .handle_event(DomainEvent {
            kind: EventKind::LeadCreated,
            tenant_id: "T1".to_string(),
            lead_id: "L1".to_string(),
            payload: lead("5559876"),
            changes: None,
            appointment: None,
            force_definition_id: None,
            occurred_at: chrono::Utc::now(),
        })
        .await
        .unwrap();
    let run_id = outcome.created_run_ids[0].clone();

    let executor = harness.executor("worker-1");
    let job_c = pending_job_for(&harness, &run_id, "c").await;
    executor.process_job(job_c).await.unwrap();

    let resumer = harness.resumer();
    let reply = workflow_core::resumer::decompose_reply("button", None, Some("Interested".to_string()), None);
    let resume = resumer.handle_reply(&"T1".to_string(), "+15559876", &reply).await.unwrap();
    match resume {
        workflow_core::resumer::ResumeOutcome::Resumed { handle, .. } => assert_eq!(handle, "interested"),
        other => panic!("expected Resumed, got {other:?}"),
    }

    // The reply resume only enqueues node `d`'s job; it still has to run
    // through the executor to create the human task and park the run.
    let job_d = pending_job_for(&harness, &run_id, "d").await;
    executor.process_job(job_d).await.unwrap();

    use workflow_core::store::StateStore;
    let run = harness.store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::WaitingForTask);
    assert!(run.waiting_for_task.is_some());
    let task_id = run.waiting_for_task.unwrap().task_id;

    let complete = resumer.handle_task_completion(&task_id, "success", None).await.unwrap();
    match complete {
        workflow_core::resumer::ResumeOutcome::Resumed { handle, .. } => assert_eq!(handle, "success"),
        other => panic!("expected Resumed, got {other:?}"),
    }
    let run = harness.store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
}

/// S3: AI-call outcome branch, matched by providerCallId on the callback.
#[tokio::test]
async fn s3_voice_call_outcome_branch() {
    let harness = Harness::new();

    let definition = WorkflowDefinition {
        id: "def-s3".to_string(),
        tenant_id: "T1".to_string(),
        name: "voice call".to_string(),
        trigger_type: TriggerType::LeadCreated,
        trigger_filter: None,
        nodes: vec![
            node("trigger", "trigger", NodeConfig::Trigger),
            node(
                "v",
                "ai call",
                NodeConfig::ActionVoiceCallWithResponse {
                    agent_ref: "agent-1".to_string(),
                    variables: HashMap::new(),
                    expected_outcomes: vec![
                        ExpectedOutcome { outcome: "interested".to_string(), next_handle: "interested".to_string() },
                        ExpectedOutcome { outcome: "not_interested".to_string(), next_handle: "not_interested".to_string() },
                        ExpectedOutcome { outcome: "no_answer".to_string(), next_handle: "retry".to_string() },
                    ],
                    timeout_seconds: 600,
                    timeout_handle: "timeout".to_string(),
                },
            ),
            node("i", "interested", NodeConfig::ActionEmail { subject: "interested".to_string(), body: "ok".to_string() }),
            node("nint", "not interested", NodeConfig::ActionEmail { subject: "not interested".to_string(), body: "ok".to_string() }),
            node("r", "retry", NodeConfig::ActionEmail { subject: "retry".to_string(), body: "ok".to_string() }),
            node("t", "gave up", NodeConfig::ActionEmail { subject: "timeout".to_string(), body: "ok".to_string() }),
        ],
        edges: vec![
            edge("trigger", "v", None),
            edge("v", "i", Some("interested")),
            edge("v", "nint", Some("not_interested")),
            edge("v", "r", Some("retry")),
            edge("v", "t", Some("timeout")),
        ],
        prevent_duplicates: false,
        run_once_per_lead: false,
        cooldown_minutes: 0,
        is_active: true,
        stats: DefinitionStats::default(),
    };
    harness.store.save_definition(definition).await.unwrap();

    let matcher = harness.trigger_matcher();
    let outcome = matcher
        .handle_event(DomainEvent {
            kind: EventKind::LeadCreated,
            tenant_id: "T1".to_string(),
            lead_id: "L1".to_string(),
            payload: lead("5551111"),
            changes: None,
            appointment: None,
            force_definition_id: None,
            occurred_at: chrono::Utc::now(),
        })
        .await
        .unwrap();
    let run_id = outcome.created_run_ids[0].clone();

    let executor = harness.executor("worker-1");
    let job_v = pending_job_for(&harness, &run_id, "v").await;
    executor.process_job(job_v).await.unwrap();

    let provider_call_id = harness.voice.placed.lock().unwrap()[0].idempotency_key.clone();
    let _ = provider_call_id;
    use workflow_core::store::StateStore;
    let run = harness.store.get_run(&run_id).await.unwrap().unwrap();
    let wait = run.waiting_for_call.clone().unwrap();
    let call_id = wait.provider_call_id.clone().unwrap();

    let resumer = harness.resumer();
    let analysis = serde_json::json!({ "evaluation_criteria_results": { "interested": "true" } });
    let resume = resumer.handle_call_outcome(Some(&call_id), None, None, "completed", Some(&analysis)).await.unwrap();
    match resume {
        workflow_core::resumer::ResumeOutcome::Resumed { handle, .. } => assert_eq!(handle, "interested"),
        other => panic!("expected Resumed, got {other:?}"),
    }

    let run = harness.store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.context.get("lastCallOutcome").and_then(|v| v.as_str()), Some("interested"));
}

/// S4: a node whose adapter fails on every attempt exhausts retries and
/// dead-letters, without a declared failure path or skip-on-failure.
#[tokio::test]
async fn s4_retry_then_dead_letter() {
    use workflow_core::adapters::memory::FakeMessagingAdapter;
    use workflow_core::store::StateStore;
    use std::sync::Arc;

    let harness = Harness::new();
    let failing_messaging = Arc::new(FakeMessagingAdapter::with_forced_error("provider unavailable"));

    let definition = WorkflowDefinition {
        id: "def-s4".to_string(),
        tenant_id: "T1".to_string(),
        name: "always fails".to_string(),
        trigger_type: TriggerType::LeadCreated,
        trigger_filter: None,
        nodes: vec![
            node("trigger", "trigger", NodeConfig::Trigger),
            Node {
                id: "m".to_string(),
                label: "flaky message".to_string(),
                config: NodeConfig::ActionMessaging { channel: "whatsapp".to_string(), template_id: Some("x".to_string()), variables: HashMap::new(), body: None, buttons: vec![] },
                execution_timeout_seconds: None,
                max_attempts: Some(3),
                skip_on_failure: false,
            },
        ],
        edges: vec![edge("trigger", "m", None)],
        prevent_duplicates: false,
        run_once_per_lead: false,
        cooldown_minutes: 0,
        is_active: true,
        stats: DefinitionStats::default(),
    };
    harness.store.save_definition(definition).await.unwrap();

    let matcher = harness.trigger_matcher();
    let outcome = matcher
        .handle_event(DomainEvent {
            kind: EventKind::LeadCreated,
            tenant_id: "T1".to_string(),
            lead_id: "L1".to_string(),
            payload: lead("5552222"),
            changes: None,
            appointment: None,
            force_definition_id: None,
            occurred_at: chrono::Utc::now(),
        })
        .await
        .unwrap();
    let run_id = outcome.created_run_ids[0].clone();

    let executor = workflow_core::Executor::new(
        harness.store.clone() as Arc<dyn workflow_core::store::StateStore>,
        harness.queue.clone(),
        failing_messaging,
        harness.voice.clone(),
        harness.tasks.clone(),
        None,
        &harness.config,
        "worker-1",
    );

    for attempt in 1..=3u32 {
        let job = pending_job_for(&harness, &run_id, "m").await;
        assert_eq!(job.attempts, attempt - 1);
        executor.process_job(job).await.unwrap();
    }

    let run = harness.store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);

    let dead_letters = harness.store.list_dead_letters().await.unwrap();
    assert_eq!(dead_letters.len(), 1);
    assert_eq!(dead_letters[0].job.node_id, "m");
}

/// S5: cooldown suppresses a re-trigger inside the window but allows one
/// once the window has elapsed.
#[tokio::test]
async fn s5_cooldown_then_allowed_after_window() {
    use workflow_core::store::StateStore;

    let harness = Harness::new();
    let definition = WorkflowDefinition {
        id: "def-s5".to_string(),
        tenant_id: "T1".to_string(),
        name: "cooldown".to_string(),
        trigger_type: TriggerType::LeadUpdated,
        trigger_filter: None,
        nodes: vec![node("trigger", "trigger", NodeConfig::Trigger)],
        edges: vec![],
        prevent_duplicates: false,
        run_once_per_lead: false,
        cooldown_minutes: 60,
        is_active: true,
        stats: DefinitionStats::default(),
    };
    harness.store.save_definition(definition).await.unwrap();

    let matcher = harness.trigger_matcher();
    let base_event = |occurred_at: chrono::DateTime<chrono::Utc>| DomainEvent {
        kind: EventKind::LeadUpdated,
        tenant_id: "T1".to_string(),
        lead_id: "L1".to_string(),
        payload: lead("5553333"),
        changes: None,
        appointment: None,
        force_definition_id: None,
        occurred_at,
    };

    let first = matcher.handle_event(base_event(chrono::Utc::now())).await.unwrap();
    assert_eq!(first.created_run_ids.len(), 1);

    let second = matcher.handle_event(base_event(chrono::Utc::now())).await.unwrap();
    assert!(second.created_run_ids.is_empty());
    assert_eq!(second.skips.len(), 1);

    // Simulate the cooldown window having elapsed by back-dating the first
    // run's startedAt rather than waiting in real time.
    let run_id = first.created_run_ids[0].clone();
    let mut run = harness.store.get_run(&run_id).await.unwrap().unwrap();
    run.started_at = chrono::Utc::now() - chrono::Duration::minutes(65);
    harness.store.cas_update_run(run).await.unwrap();

    let third = matcher.handle_event(base_event(chrono::Utc::now())).await.unwrap();
    assert_eq!(third.created_run_ids.len(), 1);
}

/// S6: a job stuck `processing` with no live worker is reclaimed by the
/// Supervisor and the run advances normally afterward.
#[tokio::test]
async fn s6_stuck_job_reclaimed_by_supervisor() {
    use workflow_core::store::StateStore;

    let harness = Harness::new();
    let definition = WorkflowDefinition {
        id: "def-s6".to_string(),
        tenant_id: "T1".to_string(),
        name: "simple".to_string(),
        trigger_type: TriggerType::LeadCreated,
        trigger_filter: None,
        nodes: vec![
            node("trigger", "trigger", NodeConfig::Trigger),
            node("e", "email", NodeConfig::ActionEmail { subject: "hi".to_string(), body: "ok".to_string() }),
        ],
        edges: vec![edge("trigger", "e", None)],
        prevent_duplicates: false,
        run_once_per_lead: false,
        cooldown_minutes: 0,
        is_active: true,
        stats: DefinitionStats::default(),
    };
    harness.store.save_definition(definition).await.unwrap();

    let matcher = harness.trigger_matcher();
    let outcome = matcher
        .handle_event(DomainEvent {
            kind: EventKind::LeadCreated,
            tenant_id: "T1".to_string(),
            lead_id: "L1".to_string(),
            payload: serde_json::json!({ "email": "lead@example.com" }),
            changes: None,
            appointment: None,
            force_definition_id: None,
            occurred_at: chrono::Utc::now(),
        })
        .await
        .unwrap();
    let run_id = outcome.created_run_ids[0].clone();

    // Simulate an executor crash mid-node: mark the job processing with no
    // worker holding it, and back-date the run so it looks stuck.
    let mut job = pending_job_for(&harness, &run_id, "e").await;
    job.status = JobStatus::Processing;
    job.last_attempt_at = Some(chrono::Utc::now() - chrono::Duration::hours(25));
    harness.store.update_job(job).await.unwrap();

    let mut run = harness.store.get_run(&run_id).await.unwrap().unwrap();
    run.updated_at = chrono::Utc::now() - chrono::Duration::hours(25);
    harness.store.cas_update_run(run).await.unwrap();

    let supervisor = harness.supervisor();
    let report = supervisor.reclaim(Some(24)).await.unwrap();
    assert_eq!(report.jobs_reset, 1);

    let job = pending_job_for(&harness, &run_id, "e").await;
    assert_eq!(job.status, JobStatus::Pending);

    let executor = harness.executor("worker-1");
    executor.process_job(job).await.unwrap();
    let run = harness.store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
}

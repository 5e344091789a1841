//! `NodeHandler`: the interface inheritance/mixins would have modeled in the
//! source (§9), replaced by one small struct per `NodeKind` implementing a
//! shared trait, looked up from a registry keyed by kind name.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::adapters::{
    idempotency_key, EmailSendRequest, MessagingAdapter, MessagingSendRequest, TaskAdapter,
    TaskCreateRequest, VoiceAdapter, VoicePlaceRequest,
};
use crate::error::AdapterError;
use crate::model::{
    ConditionOperator, ConditionSpec, LeadView, Node, NodeConfig, Run, WaitingForCall,
    WaitingForReply, WaitingForTask,
};

/// Everything a handler needs, borrowed for the duration of one execution
/// attempt. `attempt` starts at 1.
pub struct HandlerInput<'a> {
    pub run: &'a Run,
    pub node: &'a Node,
    pub attempt: u32,
    pub default_country_prefix: &'a str,
}

impl<'a> HandlerInput<'a> {
    fn lead(&self) -> LeadView<'_> {
        LeadView::new(self.run.context.get("lead").unwrap_or(&serde_json::Value::Null))
    }
}

pub enum HandlerOutcome {
    /// The node finished; take the named handle (or the unlabeled fallback
    /// when `None`) to find successors.
    Completed { handle: Option<String>, result: serde_json::Value },
    WaitingForReply(WaitingForReply),
    WaitingForCall(WaitingForCall),
    WaitingForTask(WaitingForTask),
}

#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn execute(&self, input: &HandlerInput<'_>) -> Result<HandlerOutcome, AdapterError>;
}

pub struct TriggerHandler;

#[async_trait]
impl NodeHandler for TriggerHandler {
    /// Normally not executed directly (the Trigger Matcher schedules the
    /// trigger's successors); if a job is ever dispatched for it, treat it as
    /// a completed no-op (§4.2 "trigger").
    async fn execute(&self, _input: &HandlerInput<'_>) -> Result<HandlerOutcome, AdapterError> {
        Ok(HandlerOutcome::Completed { handle: None, result: serde_json::Value::Null })
    }
}

pub struct DelayHandler;

#[async_trait]
impl NodeHandler for DelayHandler {
    async fn execute(&self, _input: &HandlerInput<'_>) -> Result<HandlerOutcome, AdapterError> {
        Ok(HandlerOutcome::Completed { handle: None, result: serde_json::Value::Null })
    }
}

pub struct ConditionHandler;

fn evaluate_condition(spec: &ConditionSpec, lead: &LeadView, context: &crate::model::RunContext) -> bool {
    let actual: serde_json::Value = match spec.field.as_str() {
        "phone" => lead.phone().map(|s| s.into()).unwrap_or(serde_json::Value::Null),
        "email" => lead.email().map(|s| s.into()).unwrap_or(serde_json::Value::Null),
        "source" => lead.source().map(|s| s.into()).unwrap_or(serde_json::Value::Null),
        "budget" => lead.budget().map(serde_json::Value::from).unwrap_or(serde_json::Value::Null),
        "category" => lead.category().map(|s| s.into()).unwrap_or(serde_json::Value::Null),
        "location" => lead.location().map(|s| s.into()).unwrap_or(serde_json::Value::Null),
        "status" => lead.status().map(|s| s.into()).unwrap_or(serde_json::Value::Null),
        "tags" => serde_json::Value::Array(lead.tags().into_iter().map(serde_json::Value::String).collect()),
        "score" => lead.score().map(serde_json::Value::from).unwrap_or(serde_json::Value::Null),
        "daysSinceContact" => lead
            .last_contact_at()
            .map(|t| (Utc::now() - t).num_days())
            .map(serde_json::Value::from)
            .unwrap_or(serde_json::Value::Null),
        "responseTime" => context.get("responseTimeSeconds").cloned().unwrap_or(serde_json::Value::Null),
        other => context.get(other).cloned().unwrap_or(serde_json::Value::Null),
    };
    apply_operator(spec.operator, &actual, spec.value.as_ref())
}

fn apply_operator(op: ConditionOperator, actual: &serde_json::Value, expected: Option<&serde_json::Value>) -> bool {
    match op {
        ConditionOperator::IsEmpty => is_empty(actual),
        ConditionOperator::IsNotEmpty => !is_empty(actual),
        ConditionOperator::Eq => expected.map(|e| values_eq(actual, e)).unwrap_or(false),
        ConditionOperator::Ne => expected.map(|e| !values_eq(actual, e)).unwrap_or(true),
        ConditionOperator::Contains => match (actual.as_str(), expected.and_then(|e| e.as_str())) {
            (Some(a), Some(e)) => a.to_lowercase().contains(&e.to_lowercase()),
            _ => false,
        },
        ConditionOperator::Gt => match (actual.as_f64(), expected.and_then(|e| e.as_f64())) {
            (Some(a), Some(e)) => a > e,
            _ => false,
        },
        ConditionOperator::Lt => match (actual.as_f64(), expected.and_then(|e| e.as_f64())) {
            (Some(a), Some(e)) => a < e,
            _ => false,
        },
        ConditionOperator::In => match expected.and_then(|e| e.as_array()) {
            Some(arr) => arr.iter().any(|v| values_eq(actual, v)),
            None => false,
        },
        ConditionOperator::NotIn => match expected.and_then(|e| e.as_array()) {
            Some(arr) => !arr.iter().any(|v| values_eq(actual, v)),
            None => true,
        },
    }
}

fn is_empty(v: &serde_json::Value) -> bool {
    match v {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.is_empty(),
        serde_json::Value::Array(a) => a.is_empty(),
        _ => false,
    }
}

fn values_eq(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    match (a.as_str(), b.as_str()) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        _ => a == b,
    }
}

#[async_trait]
impl NodeHandler for ConditionHandler {
    async fn execute(&self, input: &HandlerInput<'_>) -> Result<HandlerOutcome, AdapterError> {
        let spec = match &input.node.config {
            NodeConfig::Condition(spec) => spec,
            NodeConfig::ConditionWithTimeout { spec, .. } => spec,
            _ => return Err(AdapterError::InvalidInput("condition handler given a non-condition node".into())),
        };
        let lead = input.lead();
        let result = evaluate_condition(spec, &lead, &input.run.context);
        let handle = if result { "true" } else { "false" };
        Ok(HandlerOutcome::Completed { handle: Some(handle.to_string()), result: serde_json::json!({ "result": result }) })
    }
}

pub struct MessagingHandler {
    pub messaging: Arc<dyn MessagingAdapter>,
}

fn normalized_phone_or_err(lead: &LeadView, prefix: &str) -> Result<String, AdapterError> {
    lead.normalized_phone(prefix)
        .ok_or_else(|| AdapterError::InvalidInput("lead has no usable phone number".into()))
}

fn build_send_request(
    node: &Node,
    run: &Run,
    tenant_id: String,
    to: String,
    idem: String,
) -> Result<MessagingSendRequest, AdapterError> {
    let (channel, template_id, variables, body, buttons) = match &node.config {
        NodeConfig::ActionMessaging { channel, template_id, variables, body, buttons } => {
            (channel.clone(), template_id.clone(), variables.clone(), body.clone(), buttons.clone())
        }
        NodeConfig::ActionMessagingWithResponse { channel, template_id, variables, body, buttons, .. } => {
            (channel.clone(), template_id.clone(), variables.clone(), body.clone(), buttons.clone())
        }
        _ => return Err(AdapterError::InvalidInput("messaging handler given a non-messaging node".into())),
    };
    if template_id.is_none() && body.is_none() {
        return Err(AdapterError::InvalidInput("messaging node requires templateId or body".into()));
    }
    let _ = &run.context;
    Ok(MessagingSendRequest { channel, tenant_id, to, template_id, variables, body, buttons, idempotency_key: idem })
}

#[async_trait]
impl NodeHandler for MessagingHandler {
    async fn execute(&self, input: &HandlerInput<'_>) -> Result<HandlerOutcome, AdapterError> {
        let lead = input.lead();
        let to = normalized_phone_or_err(&lead, input.default_country_prefix)?;
        let idem = idempotency_key(&input.run.id, &input.node.id, input.attempt);
        let request = build_send_request(input.node, input.run, input.run.tenant_id.clone(), to, idem)?;
        let result = self.messaging.send(request).await?;
        Ok(HandlerOutcome::Completed {
            handle: None,
            result: serde_json::json!({ "providerMessageId": result.provider_message_id }),
        })
    }
}

pub struct MessagingWithResponseHandler {
    pub messaging: Arc<dyn MessagingAdapter>,
}

#[async_trait]
impl NodeHandler for MessagingWithResponseHandler {
    async fn execute(&self, input: &HandlerInput<'_>) -> Result<HandlerOutcome, AdapterError> {
        let (expected_responses, timeout_seconds, timeout_handle) = match &input.node.config {
            NodeConfig::ActionMessagingWithResponse { expected_responses, timeout_seconds, timeout_handle, .. } => {
                (expected_responses.clone(), *timeout_seconds, timeout_handle.clone())
            }
            _ => return Err(AdapterError::InvalidInput("expected action.messagingWithResponse config".into())),
        };
        let lead = input.lead();
        let to = normalized_phone_or_err(&lead, input.default_country_prefix)?;
        let idem = idempotency_key(&input.run.id, &input.node.id, input.attempt);
        let request = build_send_request(input.node, input.run, input.run.tenant_id.clone(), to, idem)?;
        let result = self.messaging.send(request).await?;
        Ok(HandlerOutcome::WaitingForReply(WaitingForReply {
            node_id: input.node.id.clone(),
            timeout_at: Utc::now() + chrono::Duration::seconds(timeout_seconds),
            expected_responses,
            timeout_handle,
        }))
        .map(|outcome| {
            tracing::debug!(provider_message_id = %result.provider_message_id, "sent interactive message, now waiting");
            outcome
        })
    }
}

pub struct WaitForResponseHandler;

#[async_trait]
impl NodeHandler for WaitForResponseHandler {
    async fn execute(&self, input: &HandlerInput<'_>) -> Result<HandlerOutcome, AdapterError> {
        let (expected_responses, timeout_seconds, timeout_handle) = match &input.node.config {
            NodeConfig::WaitForResponse { expected_responses, timeout_seconds, timeout_handle } => {
                (expected_responses.clone(), *timeout_seconds, timeout_handle.clone())
            }
            _ => return Err(AdapterError::InvalidInput("expected waitForResponse config".into())),
        };
        Ok(HandlerOutcome::WaitingForReply(WaitingForReply {
            node_id: input.node.id.clone(),
            timeout_at: Utc::now() + chrono::Duration::seconds(timeout_seconds),
            expected_responses,
            timeout_handle,
        }))
    }
}

pub struct VoiceCallHandler {
    pub voice: Arc<dyn VoiceAdapter>,
}

#[async_trait]
impl NodeHandler for VoiceCallHandler {
    async fn execute(&self, input: &HandlerInput<'_>) -> Result<HandlerOutcome, AdapterError> {
        let (agent_ref, variables) = match &input.node.config {
            NodeConfig::ActionVoiceCall { agent_ref, variables } => (agent_ref.clone(), variables.clone()),
            _ => return Err(AdapterError::InvalidInput("expected action.voiceCall config".into())),
        };
        let lead = input.lead();
        let to = normalized_phone_or_err(&lead, input.default_country_prefix)?;
        let idem = idempotency_key(&input.run.id, &input.node.id, input.attempt);
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("runId".to_string(), serde_json::Value::String(input.run.id.clone()));
        metadata.insert("leadId".to_string(), serde_json::Value::String(input.run.lead_id.clone()));
        metadata.insert("nodeId".to_string(), serde_json::Value::String(input.node.id.clone()));
        let result = self
            .voice
            .place(crate::adapters::VoicePlaceRequest {
                tenant_id: input.run.tenant_id.clone(),
                to,
                agent_ref,
                variables,
                metadata,
                idempotency_key: idem,
            })
            .await?;
        Ok(HandlerOutcome::Completed {
            handle: None,
            result: serde_json::json!({
                "providerCallId": result.provider_call_id,
                "providerConversationId": result.provider_conversation_id,
            }),
        })
    }
}

pub struct VoiceCallWithResponseHandler {
    pub voice: Arc<dyn VoiceAdapter>,
}

#[async_trait]
impl NodeHandler for VoiceCallWithResponseHandler {
    async fn execute(&self, input: &HandlerInput<'_>) -> Result<HandlerOutcome, AdapterError> {
        let (agent_ref, variables, expected_outcomes, timeout_seconds, timeout_handle) = match &input.node.config {
            NodeConfig::ActionVoiceCallWithResponse { agent_ref, variables, expected_outcomes, timeout_seconds, timeout_handle } => {
                (agent_ref.clone(), variables.clone(), expected_outcomes.clone(), *timeout_seconds, timeout_handle.clone())
            }
            _ => return Err(AdapterError::InvalidInput("expected action.voiceCallWithResponse config".into())),
        };
        let lead = input.lead();
        let to = normalized_phone_or_err(&lead, input.default_country_prefix)?;
        let idem = idempotency_key(&input.run.id, &input.node.id, input.attempt);
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("runId".to_string(), serde_json::Value::String(input.run.id.clone()));
        metadata.insert("nodeId".to_string(), serde_json::Value::String(input.node.id.clone()));
        let result = self
            .voice
            .place(VoicePlaceRequest { tenant_id: input.run.tenant_id.clone(), to, agent_ref, variables, metadata, idempotency_key: idem })
            .await?;
        Ok(HandlerOutcome::WaitingForCall(WaitingForCall {
            node_id: input.node.id.clone(),
            provider_call_id: Some(result.provider_call_id),
            provider_conversation_id: Some(result.provider_conversation_id),
            timeout_at: Utc::now() + chrono::Duration::seconds(timeout_seconds),
            expected_outcomes,
            timeout_handle,
        }))
    }
}

pub struct HumanTaskHandler {
    pub tasks: Arc<dyn TaskAdapter>,
}

#[async_trait]
impl NodeHandler for HumanTaskHandler {
    async fn execute(&self, input: &HandlerInput<'_>) -> Result<HandlerOutcome, AdapterError> {
        let (task_kind, due_in_seconds, assignment) = match &input.node.config {
            NodeConfig::ActionHumanTask { task_kind, due_in_seconds, assignment, .. } => {
                (task_kind.clone(), *due_in_seconds, assignment.clone())
            }
            _ => return Err(AdapterError::InvalidInput("expected action.humanTask config".into())),
        };
        let result = self
            .tasks
            .create(TaskCreateRequest {
                tenant_id: input.run.tenant_id.clone(),
                run_id: input.run.id.clone(),
                node_id: input.node.id.clone(),
                lead_id: input.run.lead_id.clone(),
                task_kind,
                due_at: Utc::now() + chrono::Duration::seconds(due_in_seconds),
                assignment,
            })
            .await?;
        Ok(HandlerOutcome::WaitingForTask(WaitingForTask { node_id: input.node.id.clone(), task_id: result.task_id }))
    }
}

pub struct EmailHandler {
    pub messaging: Arc<dyn MessagingAdapter>,
}

#[async_trait]
impl NodeHandler for EmailHandler {
    async fn execute(&self, input: &HandlerInput<'_>) -> Result<HandlerOutcome, AdapterError> {
        let (subject, body) = match &input.node.config {
            NodeConfig::ActionEmail { subject, body } => (subject.clone(), body.clone()),
            _ => return Err(AdapterError::InvalidInput("expected action.email config".into())),
        };
        let lead = input.lead();
        let to = lead.email().ok_or_else(|| AdapterError::InvalidInput("lead has no email address".into()))?;
        let idem = idempotency_key(&input.run.id, &input.node.id, input.attempt);
        let result = self
            .messaging
            .send_email(EmailSendRequest { tenant_id: input.run.tenant_id.clone(), to: to.to_string(), subject, body, idempotency_key: idem })
            .await?;
        Ok(HandlerOutcome::Completed { handle: None, result: serde_json::json!({ "providerMessageId": result.provider_message_id }) })
    }
}

/// The registry keyed by `NodeKind` (§9 "Inheritance / mixins...replaced by
/// an interface...with a registry keyed by `NodeKind`").
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Box<dyn NodeHandler>>,
}

impl HandlerRegistry {
    pub fn new(
        messaging: Arc<dyn MessagingAdapter>,
        voice: Arc<dyn VoiceAdapter>,
        tasks: Arc<dyn TaskAdapter>,
    ) -> Self {
        let mut handlers: HashMap<&'static str, Box<dyn NodeHandler>> = HashMap::new();
        handlers.insert("trigger", Box::new(TriggerHandler));
        handlers.insert("delay", Box::new(DelayHandler));
        handlers.insert("condition", Box::new(ConditionHandler));
        handlers.insert("conditionWithTimeout", Box::new(ConditionHandler));
        handlers.insert("action.messaging", Box::new(MessagingHandler { messaging: messaging.clone() }));
        handlers.insert(
            "action.messagingWithResponse",
            Box::new(MessagingWithResponseHandler { messaging: messaging.clone() }),
        );
        handlers.insert("waitForResponse", Box::new(WaitForResponseHandler));
        handlers.insert("action.voiceCall", Box::new(VoiceCallHandler { voice: voice.clone() }));
        handlers.insert(
            "action.voiceCallWithResponse",
            Box::new(VoiceCallWithResponseHandler { voice: voice.clone() }),
        );
        handlers.insert("action.humanTask", Box::new(HumanTaskHandler { tasks }));
        handlers.insert("action.email", Box::new(EmailHandler { messaging }));
        HandlerRegistry { handlers }
    }

    pub fn get(&self, kind: &str) -> Option<&dyn NodeHandler> {
        self.handlers.get(kind).map(|b| b.as_ref())
    }
}

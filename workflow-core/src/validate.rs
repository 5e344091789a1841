//! Graph validation, callable both at definition-save time and defensively
//! before first dispatch of a trigger.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::model::{NodeConfig, WorkflowDefinition};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning(pub String);

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("definition must have exactly one trigger node, found {0}")]
    TriggerCount(usize),
    #[error("trigger node {0} must have no incoming edges")]
    TriggerHasIncoming(String),
    #[error("node(s) unreachable from the trigger: {0:?}")]
    Unreachable(Vec<String>),
    #[error("cycle detected in workflow graph")]
    Cycle,
    #[error("edge references unknown node: {0} -> {1}")]
    DanglingEdge(String, String),
    #[error("node {0} ({1}) is missing required config: {2}")]
    MissingConfig(String, &'static str, String),
    #[error("condition node {0} has more than one edge labeled {1:?}")]
    DuplicateHandle(String, String),
}

/// Runs every §6 pre-save check. Returns warnings (non-fatal) alongside
/// `Ok(())`, or the first validation error encountered.
pub fn validate_definition(definition: &WorkflowDefinition) -> Result<Vec<ValidationWarning>, ValidationError> {
    let triggers: Vec<_> = definition.nodes.iter().filter(|n| matches!(n.config, NodeConfig::Trigger)).collect();
    if triggers.len() != 1 {
        return Err(ValidationError::TriggerCount(triggers.len()));
    }
    let trigger = triggers[0];

    let node_ids: HashSet<&str> = definition.nodes.iter().map(|n| n.id.as_str()).collect();
    for edge in &definition.edges {
        if !node_ids.contains(edge.from.as_str()) {
            return Err(ValidationError::DanglingEdge(edge.from.clone(), edge.to.clone()));
        }
        if !node_ids.contains(edge.to.as_str()) {
            return Err(ValidationError::DanglingEdge(edge.from.clone(), edge.to.clone()));
        }
        if edge.to == trigger.id {
            return Err(ValidationError::TriggerHasIncoming(trigger.id.clone()));
        }
    }

    // Weak connectivity from the trigger (treat edges as undirected for reachability).
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &definition.edges {
        adjacency.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
        adjacency.entry(edge.to.as_str()).or_default().push(edge.from.as_str());
    }
    let mut seen: HashSet<&str> = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(trigger.id.as_str());
    seen.insert(trigger.id.as_str());
    while let Some(id) = queue.pop_front() {
        for next in adjacency.get(id).into_iter().flatten() {
            if seen.insert(next) {
                queue.push_back(next);
            }
        }
    }
    let unreachable: Vec<String> = node_ids.iter().filter(|id| !seen.contains(*id)).map(|s| s.to_string()).collect();
    if !unreachable.is_empty() {
        return Err(ValidationError::Unreachable(unreachable));
    }

    // Acyclicity via directed DFS from the trigger.
    if has_cycle(definition) {
        return Err(ValidationError::Cycle);
    }

    // Per-kind required config, and the condition duplicate-handle rule.
    let mut warnings = Vec::new();
    for node in &definition.nodes {
        validate_node_config(node)?;
        if matches!(node.config, NodeConfig::Condition(_) | NodeConfig::ConditionWithTimeout { .. }) {
            for handle in ["true", "false"] {
                let count = definition
                    .edges
                    .iter()
                    .filter(|e| e.from == node.id && e.handle.as_deref() == Some(handle))
                    .count();
                if count > 1 {
                    return Err(ValidationError::DuplicateHandle(node.id.clone(), handle.to_string()));
                }
            }
            let has_outgoing = definition.edges.iter().any(|e| e.from == node.id);
            if !has_outgoing {
                warnings.push(ValidationWarning(format!("condition node {} has no outgoing edges", node.id)));
            }
        }
    }

    Ok(warnings)
}

fn has_cycle(definition: &WorkflowDefinition) -> bool {
    #[derive(PartialEq, Clone, Copy)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }
    let mut marks: HashMap<&str, Mark> =
        definition.nodes.iter().map(|n| (n.id.as_str(), Mark::Unvisited)).collect();

    fn visit<'a>(
        id: &'a str,
        definition: &'a WorkflowDefinition,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> bool {
        match marks.get(id).copied().unwrap_or(Mark::Unvisited) {
            Mark::Done => return false,
            Mark::InProgress => return true,
            Mark::Unvisited => {}
        }
        marks.insert(id, Mark::InProgress);
        for edge in definition.edges.iter().filter(|e| e.from == id) {
            if visit(&edge.to, definition, marks) {
                return true;
            }
        }
        marks.insert(id, Mark::Done);
        false
    }

    definition.nodes.iter().any(|n| visit(&n.id, definition, &mut marks))
}

fn validate_node_config(node: &crate::model::Node) -> Result<(), ValidationError> {
    use NodeConfig::*;
    match &node.config {
        Trigger | Delay { .. } | Condition(_) => Ok(()),
        ActionMessaging { template_id, body, .. } => {
            if template_id.is_none() && body.is_none() {
                return Err(ValidationError::MissingConfig(node.id.clone(), "action.messaging", "templateId or body".into()));
            }
            Ok(())
        }
        ActionMessagingWithResponse { template_id, body, expected_responses, .. } => {
            if template_id.is_none() && body.is_none() {
                return Err(ValidationError::MissingConfig(node.id.clone(), "action.messagingWithResponse", "templateId or body".into()));
            }
            if expected_responses.is_empty() {
                return Err(ValidationError::MissingConfig(node.id.clone(), "action.messagingWithResponse", "expectedResponses".into()));
            }
            Ok(())
        }
        ActionVoiceCall { agent_ref, .. } => {
            if agent_ref.is_empty() {
                return Err(ValidationError::MissingConfig(node.id.clone(), "action.voiceCall", "agentRef".into()));
            }
            Ok(())
        }
        ActionVoiceCallWithResponse { agent_ref, expected_outcomes, .. } => {
            if agent_ref.is_empty() {
                return Err(ValidationError::MissingConfig(node.id.clone(), "action.voiceCallWithResponse", "agentRef".into()));
            }
            if expected_outcomes.is_empty() {
                return Err(ValidationError::MissingConfig(node.id.clone(), "action.voiceCallWithResponse", "expectedOutcomes".into()));
            }
            Ok(())
        }
        ActionHumanTask { task_kind, .. } => {
            if task_kind.is_empty() {
                return Err(ValidationError::MissingConfig(node.id.clone(), "action.humanTask", "taskKind".into()));
            }
            Ok(())
        }
        ActionEmail { subject, body } => {
            if subject.is_empty() || body.is_empty() {
                return Err(ValidationError::MissingConfig(node.id.clone(), "action.email", "subject and body".into()));
            }
            Ok(())
        }
        ConditionWithTimeout { spec, .. } => {
            if spec.field.is_empty() {
                return Err(ValidationError::MissingConfig(node.id.clone(), "conditionWithTimeout", "field".into()));
            }
            Ok(())
        }
        WaitForResponse { expected_responses, .. } => {
            if expected_responses.is_empty() {
                return Err(ValidationError::MissingConfig(node.id.clone(), "waitForResponse", "expectedResponses".into()));
            }
            Ok(())
        }
    }
}

//! Workflow definitions: the immutable graph of nodes a run is compiled against.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type DefinitionId = String;
pub type NodeId = String;
pub type TenantId = String;
pub type LeadId = String;

/// Trigger kinds a definition can be armed against.
///
/// `SiteVisitScheduled` is the legacy spelling kept for definitions persisted
/// before the `AppointmentScheduled` rename (§6 backward-compat hooks); new
/// definitions should be saved with `AppointmentScheduled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TriggerType {
    LeadCreated,
    LeadUpdated,
    AppointmentScheduled,
    SiteVisitScheduled,
    Manual,
}

impl TriggerType {
    /// Normalizes the legacy `SiteVisitScheduled` alias to `AppointmentScheduled`.
    pub fn normalized(self) -> Self {
        match self {
            TriggerType::SiteVisitScheduled => TriggerType::AppointmentScheduled,
            other => other,
        }
    }
}

/// A predicate over the lead snapshot evaluated at trigger-matching time.
/// Every populated field is AND-combined; an absent filter always passes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerFilter {
    pub source_in: Option<BTreeSet<String>>,
    pub budget_min: Option<f64>,
    pub budget_max: Option<f64>,
    /// Preferred field. Falls back to `property_type_in` when empty (§6 alias).
    pub category_in: Option<BTreeSet<String>>,
    #[serde(default)]
    pub property_type_in: Option<BTreeSet<String>>,
    pub location_contains_any_of: Option<Vec<String>>,
    pub status_from: Option<String>,
    pub status_to: Option<String>,
}

impl TriggerFilter {
    /// The category set to evaluate against, honoring the `category` /
    /// `propertyType` alias: the newer field wins if both are present and
    /// non-empty, otherwise the legacy field is used.
    pub fn effective_categories(&self) -> Option<&BTreeSet<String>> {
        match (&self.category_in, &self.property_type_in) {
            (Some(c), _) if !c.is_empty() => Some(c),
            (_, Some(p)) if !p.is_empty() => Some(p),
            (Some(c), None) => Some(c),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DelayUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl DelayUnit {
    pub fn to_seconds(self, duration: i64) -> i64 {
        match self {
            DelayUnit::Seconds => duration,
            DelayUnit::Minutes => duration * 60,
            DelayUnit::Hours => duration * 3600,
            DelayUnit::Days => duration * 86_400,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExpectedResponseKind {
    Any,
    Button,
    TextRegex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedResponse {
    pub kind: ExpectedResponseKind,
    /// Button payload/text to match, or the regex source, depending on `kind`.
    /// Unused for `kind == Any`.
    #[serde(default)]
    pub value: Option<String>,
    pub next_handle: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedOutcome {
    pub outcome: String,
    pub next_handle: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConditionOperator {
    Eq,
    Ne,
    Contains,
    Gt,
    Lt,
    In,
    NotIn,
    IsEmpty,
    IsNotEmpty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionSpec {
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

/// Tagged configuration, one variant per `NodeKind` in §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum NodeConfig {
    Trigger,

    #[serde(rename = "action.messaging")]
    ActionMessaging {
        channel: String,
        #[serde(default)]
        template_id: Option<String>,
        #[serde(default)]
        variables: HashMap<String, serde_json::Value>,
        #[serde(default)]
        body: Option<String>,
        #[serde(default)]
        buttons: Vec<String>,
    },

    #[serde(rename = "action.messagingWithResponse")]
    ActionMessagingWithResponse {
        channel: String,
        #[serde(default)]
        template_id: Option<String>,
        #[serde(default)]
        variables: HashMap<String, serde_json::Value>,
        #[serde(default)]
        body: Option<String>,
        #[serde(default)]
        buttons: Vec<String>,
        expected_responses: Vec<ExpectedResponse>,
        timeout_seconds: i64,
        #[serde(default = "default_timeout_handle")]
        timeout_handle: String,
    },

    #[serde(rename = "action.voiceCall")]
    ActionVoiceCall {
        agent_ref: String,
        #[serde(default)]
        variables: HashMap<String, serde_json::Value>,
    },

    #[serde(rename = "action.voiceCallWithResponse")]
    ActionVoiceCallWithResponse {
        agent_ref: String,
        #[serde(default)]
        variables: HashMap<String, serde_json::Value>,
        expected_outcomes: Vec<ExpectedOutcome>,
        timeout_seconds: i64,
        #[serde(default = "default_timeout_handle")]
        timeout_handle: String,
    },

    #[serde(rename = "action.humanTask")]
    ActionHumanTask {
        task_kind: String,
        due_in_seconds: i64,
        #[serde(default)]
        assignment: Option<String>,
        #[serde(default)]
        timeout_seconds: Option<i64>,
        #[serde(default = "default_timeout_handle")]
        timeout_handle: String,
    },

    #[serde(rename = "action.email")]
    ActionEmail {
        subject: String,
        body: String,
    },

    Condition(ConditionSpec),

    ConditionWithTimeout {
        #[serde(flatten)]
        spec: ConditionSpec,
        timeout_seconds: i64,
        #[serde(default = "default_timeout_handle")]
        timeout_handle: String,
    },

    Delay {
        duration: i64,
        unit: DelayUnit,
    },

    WaitForResponse {
        expected_responses: Vec<ExpectedResponse>,
        timeout_seconds: i64,
        #[serde(default = "default_timeout_handle")]
        timeout_handle: String,
    },
}

fn default_timeout_handle() -> String {
    "timeout".to_string()
}

impl NodeConfig {
    pub fn kind_name(&self) -> &'static str {
        match self {
            NodeConfig::Trigger => "trigger",
            NodeConfig::ActionMessaging { .. } => "action.messaging",
            NodeConfig::ActionMessagingWithResponse { .. } => "action.messagingWithResponse",
            NodeConfig::ActionVoiceCall { .. } => "action.voiceCall",
            NodeConfig::ActionVoiceCallWithResponse { .. } => "action.voiceCallWithResponse",
            NodeConfig::ActionHumanTask { .. } => "action.humanTask",
            NodeConfig::ActionEmail { .. } => "action.email",
            NodeConfig::Condition(_) => "condition",
            NodeConfig::ConditionWithTimeout { .. } => "conditionWithTimeout",
            NodeConfig::Delay { .. } => "delay",
            NodeConfig::WaitForResponse { .. } => "waitForResponse",
        }
    }

    /// True for node kinds that may declare `skipOnFailure` / a `failure`
    /// handle and thus go through the retry/failure-path machinery (§7).
    /// `delay`, `condition` and `trigger` nodes never invoke an adapter and
    /// so cannot fail transiently.
    pub fn can_fail(&self) -> bool {
        !matches!(
            self,
            NodeConfig::Trigger | NodeConfig::Delay { .. } | NodeConfig::Condition(_)
        )
    }

    /// The scheduling delay, in seconds, to apply when enqueueing a job for
    /// this node as a trigger/resume successor: 0 unless the node is itself a
    /// `delay` node (§4.1 step e, §4.2 "delay").
    pub fn initial_delay_seconds(&self) -> i64 {
        match self {
            NodeConfig::Delay { duration, unit } => unit.to_seconds(*duration),
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    pub label: String,
    pub config: NodeConfig,
    /// Per-node override of the wall-clock execution timeout (§4.2, default 120s).
    #[serde(default)]
    pub execution_timeout_seconds: Option<i64>,
    /// Max attempts for this node's job, overriding the engine default (§7).
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Exhaustion marks the node `skipped` and continues along non-failure
    /// edges instead of failing the run (§7). A declared `failure`/`error`
    /// edge still takes precedence over this flag.
    #[serde(default)]
    pub skip_on_failure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    /// `None` marks an unlabeled fallback edge (§4.2 tie-break rule).
    #[serde(default)]
    pub handle: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionStats {
    pub runs_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: DefinitionId,
    pub tenant_id: TenantId,
    pub name: String,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub trigger_filter: Option<TriggerFilter>,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub prevent_duplicates: bool,
    #[serde(default)]
    pub run_once_per_lead: bool,
    #[serde(default)]
    pub cooldown_minutes: i64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub stats: DefinitionStats,
}

fn default_true() -> bool {
    true
}

impl WorkflowDefinition {
    pub fn trigger_node(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| matches!(n.config, NodeConfig::Trigger))
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Outgoing edges from `node_id`, preferring the one labeled `handle`;
    /// falling back to any unlabeled edges when no edge carries that label
    /// (§4.2 tie-break: fan-out is valid, all matches are returned).
    pub fn successors(&self, node_id: &str, handle: Option<&str>) -> Vec<&Edge> {
        let labeled: Vec<&Edge> = self
            .edges
            .iter()
            .filter(|e| e.from == node_id && e.handle.as_deref() == handle)
            .collect();
        if !labeled.is_empty() || handle.is_none() {
            return labeled;
        }
        self.edges
            .iter()
            .filter(|e| e.from == node_id && e.handle.is_none())
            .collect()
    }
}

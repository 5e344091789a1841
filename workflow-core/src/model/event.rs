//! Domain events consumed by the Trigger Matcher, and the `LeadView` adapter
//! that resolves duck-typed lead payload aliases (§9 "Duck-typed lead payloads").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::definition::{DefinitionId, LeadId, TenantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    LeadCreated,
    LeadUpdated,
    AppointmentScheduled,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    pub kind: EventKind,
    pub tenant_id: TenantId,
    pub lead_id: LeadId,
    /// Lead snapshot at event time.
    pub payload: serde_json::Value,
    /// Present for `LeadUpdated`: the set of changed field names and their
    /// previous values, used to evaluate `statusFrom`/`statusTo` filters.
    #[serde(default)]
    pub changes: Option<serde_json::Value>,
    /// Present for `AppointmentScheduled`.
    #[serde(default)]
    pub appointment: Option<serde_json::Value>,
    /// Present for `Manual`: bypasses trigger-type filtering entirely.
    #[serde(default)]
    pub force_definition_id: Option<DefinitionId>,
    pub occurred_at: DateTime<Utc>,
}

/// A handle returned by the event-intake API (§6) for observability; carries
/// nothing callers need to act on beyond confirming receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventHandle {
    pub event_id: String,
    pub accepted_at: DateTime<Utc>,
}

/// Typed, alias-resolving view over a duck-typed lead JSON payload. Unknown
/// fields are ignored rather than rejected.
pub struct LeadView<'a> {
    raw: &'a serde_json::Value,
}

impl<'a> LeadView<'a> {
    pub fn new(raw: &'a serde_json::Value) -> Self {
        LeadView { raw }
    }

    fn str_field(&self, name: &str) -> Option<&str> {
        self.raw.get(name).and_then(|v| v.as_str())
    }

    pub fn source(&self) -> Option<&str> {
        self.str_field("source")
    }

    pub fn budget(&self) -> Option<f64> {
        self.raw.get("budget").and_then(|v| v.as_f64())
    }

    /// `category`, falling back to the legacy `propertyType` field (§6).
    pub fn category(&self) -> Option<&str> {
        self.str_field("category").or_else(|| self.str_field("propertyType"))
    }

    pub fn location(&self) -> Option<&str> {
        self.str_field("location")
    }

    pub fn status(&self) -> Option<&str> {
        self.str_field("status")
    }

    pub fn tags(&self) -> Vec<String> {
        self.raw
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(|s| s.to_string())).collect())
            .unwrap_or_default()
    }

    pub fn score(&self) -> Option<f64> {
        self.raw.get("score").and_then(|v| v.as_f64())
    }

    pub fn phone(&self) -> Option<&str> {
        self.str_field("phone")
    }

    pub fn email(&self) -> Option<&str> {
        self.str_field("email")
    }

    pub fn last_contact_at(&self) -> Option<DateTime<Utc>> {
        self.raw
            .get("lastContactAt")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Normalizes `phone()` to E.164, applying `default_country_prefix` (e.g.
    /// "+1") when the stored number has no leading `+` (§4.2 messaging
    /// pre-flight).
    pub fn normalized_phone(&self, default_country_prefix: &str) -> Option<String> {
        let raw = self.phone()?;
        let digits: String = raw.chars().filter(|c| c.is_ascii_digit() || *c == '+').collect();
        if digits.starts_with('+') {
            Some(digits)
        } else if digits.is_empty() {
            None
        } else {
            Some(format!("{default_country_prefix}{digits}"))
        }
    }
}

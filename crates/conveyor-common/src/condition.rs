//! Tri-state lifecycle conditions.
//!
//! A condition is `Unknown` while its phase is in progress and settles on
//! `True` or `False`. Absence of a condition means the phase has not started.
//! Timestamps are only touched when something actually changes, so applying
//! the same transition twice leaves the object byte-identical.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    Initialized,
    Provisioned,
    Built,
    Notified,
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConditionType::Initialized => "Initialized",
            ConditionType::Provisioned => "Provisioned",
            ConditionType::Built => "Built",
            ConditionType::Notified => "Notified",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    Unknown,
    True,
    False,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: ConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    fn new(kind: ConditionType, status: ConditionStatus) -> Self {
        let now = Utc::now();
        Self {
            kind,
            status,
            reason: String::new(),
            message: String::new(),
            last_update_time: Some(now),
            last_transition_time: Some(now),
        }
    }
}

/// Ordered set of conditions, at most one per [`ConditionType`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conditions(Vec<Condition>);

impl Conditions {
    pub fn get(&self, kind: ConditionType) -> Option<&Condition> {
        self.0.iter().find(|c| c.kind == kind)
    }

    pub fn status(&self, kind: ConditionType) -> Option<ConditionStatus> {
        self.get(kind).map(|c| c.status)
    }

    pub fn is_set(&self, kind: ConditionType) -> bool {
        self.get(kind).is_some()
    }

    pub fn is_true(&self, kind: ConditionType) -> bool {
        self.status(kind) == Some(ConditionStatus::True)
    }

    pub fn is_false(&self, kind: ConditionType) -> bool {
        self.status(kind) == Some(ConditionStatus::False)
    }

    pub fn is_unknown(&self, kind: ConditionType) -> bool {
        self.status(kind) == Some(ConditionStatus::Unknown)
    }

    pub fn message(&self, kind: ConditionType) -> &str {
        self.get(kind).map(|c| c.message.as_str()).unwrap_or("")
    }

    pub fn reason(&self, kind: ConditionType) -> &str {
        self.get(kind).map(|c| c.reason.as_str()).unwrap_or("")
    }

    /// True when any of the lifecycle phases has settled on `False`.
    pub fn any_failed(&self) -> bool {
        [
            ConditionType::Initialized,
            ConditionType::Provisioned,
            ConditionType::Built,
        ]
        .into_iter()
        .any(|kind| self.is_false(kind))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    fn find_or_create(&mut self, kind: ConditionType) -> &mut Condition {
        let idx = match self.0.iter().position(|c| c.kind == kind) {
            Some(idx) => idx,
            None => {
                self.0.push(Condition::new(kind, ConditionStatus::Unknown));
                self.0.len() - 1
            }
        };
        &mut self.0[idx]
    }

    pub fn create_unknown_if_missing(&mut self, kind: ConditionType) {
        self.find_or_create(kind);
    }

    pub fn set_status(&mut self, kind: ConditionType, status: ConditionStatus) {
        let cond = self.find_or_create(kind);
        if cond.status != status {
            let now = Utc::now();
            cond.status = status;
            cond.last_transition_time = Some(now);
            cond.last_update_time = Some(now);
        }
    }

    pub fn set_true(&mut self, kind: ConditionType) {
        self.set_status(kind, ConditionStatus::True);
    }

    pub fn set_false(&mut self, kind: ConditionType) {
        self.set_status(kind, ConditionStatus::False);
    }

    pub fn set_unknown(&mut self, kind: ConditionType) {
        self.set_status(kind, ConditionStatus::Unknown);
    }

    pub fn set_message(&mut self, kind: ConditionType, message: impl Into<String>) {
        let message = message.into();
        let cond = self.find_or_create(kind);
        if cond.message != message {
            cond.message = message;
            cond.last_update_time = Some(Utc::now());
        }
    }

    pub fn set_reason(&mut self, kind: ConditionType, reason: impl Into<String>) {
        let reason = reason.into();
        let cond = self.find_or_create(kind);
        if cond.reason != reason {
            cond.reason = reason;
            cond.last_update_time = Some(Utc::now());
        }
    }

    /// Record an error as `reason = "Error"` and `message = <error>`.
    pub fn set_error(&mut self, kind: ConditionType, err: &dyn fmt::Display) {
        self.set_reason(kind, "Error");
        self.set_message(kind, err.to_string());
    }

    /// Mark the condition `False` and record the error on it.
    pub fn fail(&mut self, kind: ConditionType, err: &dyn fmt::Display) {
        self.set_false(kind);
        self.set_error(kind, err);
    }
}

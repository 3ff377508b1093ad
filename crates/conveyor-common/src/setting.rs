use serde::{Deserialize, Serialize};

use crate::impl_object;
use crate::meta::ObjectMeta;

/// Name of the per-project setting capping concurrently active executions.
pub const EXECUTOR_QUOTA: &str = "executor-quota";
/// Name of the per-project setting holding the registry certificate lifetime.
pub const SIGNING_DURATION: &str = "registry-signing-duration";

/// A named pipeline setting, stored in the project's namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSetting {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub default: String,
    #[serde(default)]
    pub value: String,
}

impl_object!(PipelineSetting, "PipelineSetting");

impl PipelineSetting {
    pub fn new(namespace: &str, name: &str, value: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            default: String::new(),
            value: value.into(),
        }
    }

    /// `value` when set, otherwise `default`.
    pub fn effective(&self) -> &str {
        if self.value.is_empty() {
            &self.default
        } else {
            &self.value
        }
    }
}

use serde::{Deserialize, Serialize};

use crate::impl_object;
use crate::meta::ObjectMeta;

/// A delivery channel. Lives in the cluster namespace and is referenced by
/// recipients as `"<cluster>:<name>"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notifier {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub display_name: String,
    pub kind: NotifierKind,
}

impl_object!(Notifier, "Notifier");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NotifierKind {
    Slack {
        url: String,
        #[serde(default)]
        default_recipient: String,
    },
    Webhook {
        url: String,
    },
    Email {
        host: String,
        port: u16,
        sender: String,
    },
}

impl Notifier {
    /// Email-like channels receive an HTML body and a subject line.
    pub fn is_email_like(&self) -> bool {
        matches!(self.kind, NotifierKind::Email { .. })
    }

    pub fn matches(&self, name: &str) -> bool {
        self.metadata.name == name || (!self.display_name.is_empty() && self.display_name == name)
    }
}

//! Completion notifications.
//!
//! Decides whether a finished execution warrants a notification, resolves
//! its recipients against the cluster's notifiers and fans the rendered
//! message out to all of them concurrently.

pub mod message;
pub mod sender;

use std::sync::Arc;

use conveyor_common::pipeline::{CONDITION_CHANGED, execution_name};
use conveyor_common::{LabelSelector, Notifier, PipelineExecution, parse_ref};
use futures::future::join_all;
use tracing::{debug, warn};

use crate::errors::NotifyError;
use crate::store::{SharedStore, Store, StoreExt};

pub use message::{Message, default_message, repo_name_from_url};
pub use sender::{HttpMessageSender, MessageSender};

/// A recipient paired with the notifier that delivers to it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub notifier: Notifier,
    pub recipient: String,
}

pub struct NotificationService {
    executions: SharedStore<PipelineExecution>,
    notifiers: SharedStore<Notifier>,
    sender: Arc<dyn MessageSender>,
    server_url: String,
}

fn lists_trigger(conditions: &[String], trigger: &str) -> bool {
    conditions.iter().any(|c| c.eq_ignore_ascii_case(trigger))
}

impl NotificationService {
    pub fn new(
        executions: SharedStore<PipelineExecution>,
        notifiers: SharedStore<Notifier>,
        sender: Arc<dyn MessageSender>,
        server_url: impl Into<String>,
    ) -> Self {
        Self {
            executions,
            notifiers,
            sender,
            server_url: server_url.into(),
        }
    }

    /// Whether the execution's notification policy fires for its final state.
    /// Lookup failures count as "no".
    pub async fn should_notify(&self, execution: &PipelineExecution) -> bool {
        let Some(policy) = &execution.spec.pipeline_config.notification else {
            return false;
        };
        if policy.recipients.is_empty() {
            return false;
        }
        let Some(state) = execution.state() else {
            return false;
        };
        if lists_trigger(&policy.condition, state.as_str()) {
            return true;
        }
        if !lists_trigger(&policy.condition, CONDITION_CHANGED) || execution.spec.run <= 1 {
            return false;
        }

        let (_, pipeline) = parse_ref(&execution.spec.pipeline_name);
        let previous_name = execution_name(pipeline, execution.spec.run - 1);
        match self
            .executions
            .get_optional(&execution.metadata.namespace, &previous_name)
            .await
        {
            Ok(Some(previous)) => previous.is_terminal() && previous.state() != Some(state),
            Ok(None) => false,
            Err(e) => {
                warn!(execution = %execution.reference(), error = %e, "Failed to read previous execution");
                false
            }
        }
    }

    /// Recipients whose notifier exists in the execution's cluster. Unknown
    /// notifiers are skipped.
    pub async fn resolve_recipients(&self, execution: &PipelineExecution) -> Result<Vec<Delivery>, NotifyError> {
        let Some(policy) = &execution.spec.pipeline_config.notification else {
            return Ok(Vec::new());
        };
        let (cluster, _) = parse_ref(&execution.spec.project_name);
        let notifiers = self.notifiers.list(cluster, &LabelSelector::everything()).await?;

        let mut deliveries = Vec::new();
        for recipient in &policy.recipients {
            let (_, name) = parse_ref(&recipient.notifier);
            let matched: Vec<_> = notifiers.iter().filter(|n| n.matches(name)).collect();
            if matched.is_empty() {
                warn!(
                    execution = %execution.reference(),
                    notifier = %recipient.notifier,
                    "Notifier not found, skipping recipient"
                );
            }
            deliveries.extend(matched.into_iter().map(|n| Delivery {
                notifier: n.clone(),
                recipient: recipient.recipient.clone(),
            }));
        }
        Ok(deliveries)
    }

    /// Deliver the completion message to every resolved recipient. All
    /// deliveries are attempted; the first failure is returned.
    pub async fn notify(&self, execution: &PipelineExecution) -> Result<(), NotifyError> {
        let deliveries = self.resolve_recipients(execution).await?;
        if deliveries.is_empty() {
            return Ok(());
        }

        let body = match &execution.spec.pipeline_config.notification {
            Some(policy) if !policy.message.is_empty() => policy.message.clone(),
            _ => default_message(&self.server_url, execution),
        };

        let sends = deliveries.iter().map(|d| {
            let rendered = message::render(&body, execution, d.notifier.is_email_like());
            let sender = self.sender.clone();
            async move { sender.send(&d.notifier, &d.recipient, &rendered).await }
        });
        let results = join_all(sends).await;

        debug!(
            execution = %execution.reference(),
            recipients = results.len(),
            "Notification fan-out complete"
        );
        results.into_iter().find(|r| r.is_err()).unwrap_or(Ok(()))
    }
}

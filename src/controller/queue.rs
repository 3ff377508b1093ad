//! Per-project admission quota and FIFO release of queued executions.
//!
//! Executions of a project live in the namespace named after the project.
//! The finish label partitions them: `"false"` is admitted and running,
//! `""` is queued, `"true"` is done.

use conveyor_common::pipeline::{ExecutionState, FINISH_LABEL, FinishMark};
use conveyor_common::{LabelSelector, Object, PipelineExecution};
use tracing::{debug, info};

use crate::controller::oldest_first;
use crate::errors::StoreError;
use crate::settings::SettingsReader;
use crate::store::SharedStore;

#[derive(Clone)]
pub struct ExecutionQueue {
    executions: SharedStore<PipelineExecution>,
    settings: SettingsReader,
}

impl ExecutionQueue {
    pub fn new(executions: SharedStore<PipelineExecution>, settings: SettingsReader) -> Self {
        Self {
            executions,
            settings,
        }
    }

    async fn with_mark(&self, project_id: &str, mark: FinishMark) -> Result<Vec<PipelineExecution>, StoreError> {
        self.executions
            .list(project_id, &LabelSelector::eq(FINISH_LABEL, mark.label_value()))
            .await
    }

    /// Whether admitting `execution` would exceed the project's quota.
    ///
    /// Queued executions created before this one are counted as ahead of
    /// it, so a newcomer cannot overtake the queue.
    pub async fn exceeds_quota(&self, project_id: &str, execution: &PipelineExecution) -> Result<bool, StoreError> {
        let Some(quota) = self.settings.executor_quota(project_id).await? else {
            return Ok(false);
        };

        let key = execution.key();
        let active = self
            .with_mark(project_id, FinishMark::Active)
            .await?
            .iter()
            .filter(|e| e.key() != key)
            .count();
        let ahead = self
            .with_mark(project_id, FinishMark::Queued)
            .await?
            .iter()
            .filter(|e| e.key() != key && oldest_first(e, execution).is_lt())
            .count();

        debug!(
            execution = %key,
            quota,
            active,
            queued_ahead = ahead,
            "Checked execution quota"
        );
        Ok(active + ahead >= quota)
    }

    /// Release the oldest queued execution of the project by moving it to
    /// `Waiting`. Returns its name, or `None` when the queue is empty.
    pub async fn promote_next(&self, project_id: &str) -> Result<Option<String>, StoreError> {
        let queued = self.with_mark(project_id, FinishMark::Queued).await?;
        let Some(mut next) = queued.into_iter().min_by(oldest_first) else {
            return Ok(None);
        };

        let name = next.metadata.name.clone();
        if next.state() != Some(ExecutionState::Waiting) {
            next.status.execution_state = Some(ExecutionState::Waiting);
            self.executions.update(next).await?;
            info!(project = %project_id, execution = %name, "Promoted queued execution");
        }
        Ok(Some(name))
    }
}

//! Per-execution lifecycle: abort handling, admission, provisioning trigger
//! and the finish path.

use std::sync::Arc;

use chrono::Utc;
use conveyor_common::pipeline::{
    ExecutionState, FinishMark, LOCAL_REGISTRY_PORT_ANNOTATION, StepState,
};
use conveyor_common::{ConditionType, LabelSelector, Object, PipelineExecution};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::controller::queue::ExecutionQueue;
use crate::controller::{persist, update_last_run_state, update_pipeline_run};
use crate::engine::PipelineEngine;
use crate::errors::{ControllerError, EngineError};
use crate::notify::NotificationService;
use crate::provision::Provisioner;
use crate::provision::resources::{LABEL_APP, LABEL_EXECUTION, RUNNER_NAME, pipeline_namespace_name};
use crate::store::{Store, StoreExt, Stores};

pub const ABORTED_MESSAGE: &str = "aborted by user";

pub struct ExecutionLifecycle {
    stores: Stores,
    engine: Arc<dyn PipelineEngine>,
    provisioner: Arc<Provisioner>,
    notifications: Arc<NotificationService>,
    queue: ExecutionQueue,
    admission: DashMap<String, Arc<Mutex<()>>>,
}

impl ExecutionLifecycle {
    pub fn new(
        stores: Stores,
        engine: Arc<dyn PipelineEngine>,
        provisioner: Arc<Provisioner>,
        notifications: Arc<NotificationService>,
        queue: ExecutionQueue,
    ) -> Self {
        Self {
            stores,
            engine,
            provisioner,
            notifications,
            queue,
            admission: DashMap::new(),
        }
    }

    /// Admission for one project is serialized so the active count read by
    /// the quota check cannot go stale before this execution is marked.
    fn admission_lock(&self, project_id: &str) -> Arc<Mutex<()>> {
        self.admission
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// One reconcile pass. Returns the execution as last persisted.
    pub async fn sync(&self, execution: PipelineExecution) -> Result<PipelineExecution, ControllerError> {
        let original = execution.clone();
        let mut execution = execution;

        if execution.state() == Some(ExecutionState::Aborted) && !execution.is_finished() {
            self.stop(&mut execution).await?;
        }

        if execution.is_finished() {
            let execution = self.finish(&original, execution).await?;
            return Ok(persist(&self.stores.executions, &original, execution).await?);
        }

        if execution.status.conditions.is_set(ConditionType::Initialized) {
            return Ok(persist(&self.stores.executions, &original, execution).await?);
        }

        let project = match execution.project() {
            Ok(project) => project,
            Err(e) => {
                warn!(execution = %execution.key(), error = %e, "Execution has an invalid project reference");
                execution.status.execution_state = Some(ExecutionState::Failed);
                execution.status.conditions.fail(ConditionType::Initialized, &e);
                execution.mark_finished();
                return Ok(persist(&self.stores.executions, &original, execution).await?);
            }
        };

        let lock = self.admission_lock(&project.project_id);
        let _guard = lock.lock().await;

        if self.queue.exceeds_quota(&project.project_id, &execution).await? {
            if execution.state() != Some(ExecutionState::Queueing) {
                info!(execution = %execution.key(), project = %project, "Project quota reached, queueing execution");
            }
            execution.status.execution_state = Some(ExecutionState::Queueing);
            execution.set_finish_mark(FinishMark::Queued);
            // A queued run still claims its run number.
            update_pipeline_run(&self.stores.pipelines, &execution).await?;
            return Ok(persist(&self.stores.executions, &original, execution).await?);
        }

        if matches!(execution.state(), None | Some(ExecutionState::Queueing)) {
            execution.status.execution_state = Some(ExecutionState::Waiting);
        }
        execution.status.started.get_or_insert_with(Utc::now);
        execution.seed_stage_status();
        update_pipeline_run(&self.stores.pipelines, &execution).await?;

        execution
            .status
            .conditions
            .create_unknown_if_missing(ConditionType::Initialized);
        execution.set_finish_mark(FinishMark::Active);

        match self.provisioner.deploy(&project).await {
            Ok(()) => self.mark_registry_port(&mut execution, &project.project_id).await,
            Err(e) => {
                warn!(execution = %execution.key(), project = %project, error = %e, "Provisioning failed");
                execution.status.execution_state = Some(ExecutionState::Failed);
                execution.status.conditions.fail(ConditionType::Initialized, &e);
                execution.mark_finished();
            }
        }

        Ok(persist(&self.stores.executions, &original, execution).await?)
    }

    /// Abort handling: stop the engine, take its final state and mark
    /// whatever was still building as aborted.
    async fn stop(&self, execution: &mut PipelineExecution) -> Result<(), ControllerError> {
        info!(execution = %execution.key(), "Stopping aborted execution");
        if execution.status.conditions.is_true(ConditionType::Initialized) {
            match self.engine.stop_execution(execution).await {
                Ok(()) | Err(EngineError::NotRunning(_)) => {}
                Err(e) => return Err(e.into()),
            }
            if let Err(e) = self.engine.sync_execution(execution).await {
                warn!(execution = %execution.key(), error = %e, "Failed to sync aborted execution");
            }
        }

        let now = Utc::now();
        execution
            .status
            .conditions
            .set_message(ConditionType::Built, ABORTED_MESSAGE);
        for stage in &mut execution.status.stages {
            if stage.state == Some(StepState::Building) {
                stage.state = Some(StepState::Aborted);
                stage.ended.get_or_insert(now);
            }
            for step in &mut stage.steps {
                if step.state == Some(StepState::Building) {
                    step.state = Some(StepState::Aborted);
                    step.ended.get_or_insert(now);
                }
            }
        }

        update_last_run_state(&self.stores.pipelines, execution).await?;
        execution.mark_finished();
        Ok(())
    }

    /// Finish path for a live execution: cleanup, at most one notification
    /// and promotion of the project's queue.
    async fn finish(
        &self,
        original: &PipelineExecution,
        mut execution: PipelineExecution,
    ) -> Result<PipelineExecution, ControllerError> {
        self.cleanup(&execution).await?;

        if !execution.status.conditions.is_set(ConditionType::Notified)
            && self.notifications.should_notify(&execution).await
        {
            // Claim the delivery before attempting it. A conflict here means
            // another pass got there first.
            execution
                .status
                .conditions
                .set_unknown(ConditionType::Notified);
            execution = persist(&self.stores.executions, original, execution).await?;
            self.deliver(&mut execution).await;
        }

        update_last_run_state(&self.stores.pipelines, &execution).await?;
        self.promote(&execution).await?;
        Ok(execution)
    }

    /// Finish path for an execution that was removed before it finished.
    pub async fn remove(&self, execution: &PipelineExecution) -> Result<(), ControllerError> {
        if execution.is_finished() && execution.status.conditions.is_set(ConditionType::Notified) {
            return Ok(());
        }
        debug!(execution = %execution.key(), "Finishing removed execution");
        self.cleanup(execution).await?;

        if !execution.status.conditions.is_set(ConditionType::Notified)
            && self.notifications.should_notify(execution).await
        {
            let mut execution = execution.clone();
            self.deliver(&mut execution).await;
        }
        self.promote(execution).await
    }

    async fn deliver(&self, execution: &mut PipelineExecution) {
        match self.notifications.notify(execution).await {
            Ok(()) => {
                info!(execution = %execution.key(), "Sent completion notification");
                execution.status.conditions.set_true(ConditionType::Notified);
            }
            Err(e) => {
                warn!(execution = %execution.key(), error = %e, "Failed to send completion notification");
                execution.status.conditions.fail(ConditionType::Notified, &e);
            }
        }
    }

    async fn promote(&self, execution: &PipelineExecution) -> Result<(), ControllerError> {
        let Ok(project) = execution.project() else {
            return Ok(());
        };
        self.queue.promote_next(&project.project_id).await?;
        Ok(())
    }

    /// Stop the engine run and delete the execution's runner pods.
    pub async fn cleanup(&self, execution: &PipelineExecution) -> Result<(), ControllerError> {
        match self.engine.stop_execution(execution).await {
            Ok(()) | Err(EngineError::NotRunning(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let Ok(project) = execution.project() else {
            return Ok(());
        };
        let ns = pipeline_namespace_name(&project.project_id);
        let selector = LabelSelector::eq(LABEL_APP, RUNNER_NAME).and(LABEL_EXECUTION, execution.name());
        for pod in self.stores.pods.list(&ns, &selector).await? {
            if self.stores.pods.delete_if_present(&ns, &pod.metadata.name).await? {
                debug!(execution = %execution.key(), pod = %pod.metadata.name, "Deleted runner pod");
            }
        }
        Ok(())
    }

    /// Record the project's registry proxy port on the execution. Failures
    /// are left for the next pass.
    async fn mark_registry_port(&self, execution: &mut PipelineExecution, project_id: &str) {
        match self.provisioner.registry_port(project_id).await {
            Ok(Some(port)) => {
                execution
                    .metadata
                    .annotations
                    .insert(LOCAL_REGISTRY_PORT_ANNOTATION.to_string(), port.to_string());
            }
            Ok(None) => {
                warn!(execution = %execution.key(), project = %project_id, "No registry port allocated yet");
            }
            Err(e) => {
                warn!(execution = %execution.key(), error = %e, "Failed to read registry port");
            }
        }
    }
}

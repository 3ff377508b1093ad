//! Periodic engine polling for admitted executions.
//!
//! The engine finishes work without producing store events, so every tick
//! lists the executions whose finish label is `"false"` and folds engine
//! progress into them.

use std::sync::Arc;
use std::time::Duration;

use conveyor_common::pipeline::{ExecutionState, FINISH_LABEL, FinishMark};
use conveyor_common::{ConditionStatus, ConditionType, LabelSelector, Object, Pipeline, PipelineExecution};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::{in_scope, persist, update_last_run_state};
use crate::engine::PipelineEngine;
use crate::errors::ControllerError;
use crate::store::SharedStore;

pub const ASSIGNING_MESSAGE: &str = "Assigning jobs to pipeline engine";
pub const WAITING_MESSAGE: &str = "Waiting for resources to be ready";

pub struct StateSyncer {
    executions: SharedStore<PipelineExecution>,
    pipelines: SharedStore<Pipeline>,
    engine: Arc<dyn PipelineEngine>,
    cluster_name: String,
    interval: Duration,
}

impl StateSyncer {
    pub fn new(
        executions: SharedStore<PipelineExecution>,
        pipelines: SharedStore<Pipeline>,
        engine: Arc<dyn PipelineEngine>,
        cluster_name: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            executions,
            pipelines,
            engine,
            cluster_name: cluster_name.into(),
            interval,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        info!(interval = ?self.interval, "State syncer started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_once().await {
                        warn!(error = %e, "State sync pass failed");
                    }
                }
            }
        }
        debug!("State syncer stopped");
    }

    /// One pass over every admitted execution of this cluster. Failures on
    /// one execution do not stop the others. Returns how many were visited.
    pub async fn sync_once(&self) -> Result<usize, ControllerError> {
        let selector = LabelSelector::eq(FINISH_LABEL, FinishMark::Active.label_value());
        let executions = self.executions.list("", &selector).await?;

        let mut visited = 0;
        for execution in executions {
            if !in_scope(&self.cluster_name, &execution) {
                continue;
            }
            visited += 1;
            let key = execution.key();
            match self.sync_execution(execution).await {
                Ok(_) => {}
                Err(e) if e.is_conflict() => {
                    debug!(execution = %key, "Sync hit a write conflict, retrying next tick");
                }
                Err(e) => warn!(execution = %key, error = %e, "Failed to sync execution"),
            }
        }
        Ok(visited)
    }

    /// Drive one execution forward against the engine and persist the result.
    pub async fn sync_execution(&self, execution: PipelineExecution) -> Result<PipelineExecution, ControllerError> {
        // Aborts are finished by the lifecycle reconciler, which also stops
        // the engine and marks the interrupted steps.
        if execution.state() == Some(ExecutionState::Aborted) {
            return Ok(execution);
        }
        let original = execution.clone();
        let mut execution = execution;
        match execution.status.conditions.status(ConditionType::Initialized) {
            Some(ConditionStatus::Unknown) => self.start(&mut execution).await,
            Some(ConditionStatus::True) => {
                if let Err(e) = self.engine.sync_execution(&mut execution).await {
                    warn!(execution = %execution.key(), error = %e, "Engine sync failed");
                    execution.status.conditions.fail(ConditionType::Built, &e);
                    execution.status.execution_state = Some(ExecutionState::Failed);
                }
            }
            // Already failed: the write below finishes it if nothing else did.
            _ => {}
        }

        let execution = persist(&self.executions, &original, execution).await?;
        update_last_run_state(&self.pipelines, &execution).await?;
        Ok(execution)
    }

    /// Hand an initialized execution to the engine once it reports ready.
    async fn start(&self, execution: &mut PipelineExecution) {
        let ready = match self.engine.pre_check(execution).await {
            Ok(ready) => ready,
            Err(e) => {
                warn!(execution = %execution.key(), error = %e, "Engine pre-check failed");
                execution.status.conditions.fail(ConditionType::Built, &e);
                execution.status.execution_state = Some(ExecutionState::Failed);
                return;
            }
        };

        let conditions = &mut execution.status.conditions;
        if !ready {
            if conditions.message(ConditionType::Initialized).is_empty() {
                conditions.set_message(ConditionType::Initialized, WAITING_MESSAGE);
            }
            return;
        }

        if let Err(e) = self.engine.run_pipeline_execution(execution).await {
            warn!(execution = %execution.key(), error = %e, "Engine failed to start execution");
            execution.status.conditions.fail(ConditionType::Provisioned, &e);
            execution.status.execution_state = Some(ExecutionState::Failed);
            return;
        }

        info!(execution = %execution.key(), "Execution handed to engine");
        let conditions = &mut execution.status.conditions;
        conditions.set_true(ConditionType::Initialized);
        conditions.create_unknown_if_missing(ConditionType::Provisioned);
        conditions.set_message(ConditionType::Provisioned, ASSIGNING_MESSAGE);
    }
}

//! Execution backend contract.
//!
//! The controllers never look inside a backend: everything they need is
//! surfaced through the execution's status by [`PipelineEngine::sync_execution`].

pub mod local;
pub mod progress;

use async_trait::async_trait;
use conveyor_common::PipelineExecution;

use crate::errors::EngineError;

pub use local::LocalEngine;

/// Abstraction over the backend that actually runs pipeline steps.
/// Real implementation: `LocalEngine`. Tests script their own.
#[async_trait]
pub trait PipelineEngine: Send + Sync {
    /// Whether the backend is ready to accept this execution.
    async fn pre_check(&self, execution: &PipelineExecution) -> Result<bool, EngineError>;

    async fn run_pipeline_execution(&self, execution: &PipelineExecution) -> Result<(), EngineError>;

    /// Discard any previous run of this execution and start again.
    async fn rerun_execution(&self, execution: &PipelineExecution) -> Result<(), EngineError>;

    /// Stop a running execution. `EngineError::NotRunning` when there is
    /// nothing to stop.
    async fn stop_execution(&self, execution: &PipelineExecution) -> Result<(), EngineError>;

    async fn get_step_log(
        &self,
        execution: &PipelineExecution,
        stage: usize,
        step: usize,
    ) -> Result<String, EngineError>;

    /// Copy backend progress into `execution.status`. Returns whether
    /// anything changed.
    async fn sync_execution(&self, execution: &mut PipelineExecution) -> Result<bool, EngineError>;
}

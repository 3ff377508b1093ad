//! Shared object model for the Conveyor pipeline orchestrator.
//!
//! Everything here is plain data plus pure helpers; persistence and side
//! effects live in the `conveyor` crate.

pub mod cluster;
pub mod condition;
pub mod meta;
pub mod notifier;
pub mod pipeline;
pub mod setting;

pub use condition::{Condition, ConditionStatus, ConditionType, Conditions};
pub use meta::{LabelSelector, Object, ObjectMeta, ProjectRef, object_key, parse_ref};
pub use notifier::{Notifier, NotifierKind};
pub use pipeline::{
    ExecutionState, FinishMark, Pipeline, PipelineConfig, PipelineExecution, StepState,
};
pub use setting::PipelineSetting;

#[derive(Debug, thiserror::Error)]
pub enum CommonError {
    #[error("invalid reference '{0}', expected '<cluster>:<project>'")]
    InvalidReference(String),

    #[error("unknown execution state '{0}'")]
    InvalidState(String),
}

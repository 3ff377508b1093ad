//! Step status transitions shared by engine adapters.
//!
//! Each helper applies one observed step outcome to the execution status and
//! keeps the stage, execution state, finish label and `Built` condition in
//! line with it.

use chrono::{DateTime, Utc};
use conveyor_common::pipeline::{ExecutionState, StepState};
use conveyor_common::{ConditionType, PipelineExecution};

fn stage_name(execution: &PipelineExecution, stage: usize) -> &str {
    execution
        .spec
        .pipeline_config
        .stages
        .get(stage)
        .map(|s| s.name.as_str())
        .unwrap_or("")
}

fn is_last_stage(execution: &PipelineExecution, stage: usize) -> bool {
    stage + 1 == execution.status.stages.len()
}

fn stamp_started(execution: &mut PipelineExecution, stage: usize, step: usize, at: DateTime<Utc>) {
    let status = &mut execution.status;
    let stage_status = &mut status.stages[stage];
    stage_status.steps[step].started.get_or_insert(at);
    stage_status.started.get_or_insert(at);
    status.started.get_or_insert(at);
}

/// Mark the execution successful and terminal.
pub fn finish_success(execution: &mut PipelineExecution, ended: DateTime<Utc>) {
    execution.status.execution_state = Some(ExecutionState::Success);
    execution.status.ended = Some(ended);
    execution.mark_finished();
    execution.status.conditions.set_true(ConditionType::Provisioned);
    execution.status.conditions.set_true(ConditionType::Built);
}

pub fn success_step(
    execution: &mut PipelineExecution,
    stage: usize,
    step: usize,
    started: DateTime<Utc>,
    ended: DateTime<Utc>,
) {
    execution.status.stages[stage].steps[step].state = Some(StepState::Success);
    execution.status.stages[stage].steps[step].ended = Some(ended);
    stamp_started(execution, stage, step, started);

    if execution.status.stages[stage].is_success() {
        execution.status.stages[stage].state = Some(StepState::Success);
        execution.status.stages[stage].ended = Some(ended);
        if is_last_stage(execution, stage) {
            finish_success(execution, ended);
        }
    }
}

pub fn fail_step(
    execution: &mut PipelineExecution,
    stage: usize,
    step: usize,
    started: DateTime<Utc>,
    ended: DateTime<Utc>,
) {
    execution.status.stages[stage].steps[step].state = Some(StepState::Failed);
    execution.status.stages[stage].state = Some(StepState::Failed);
    if execution.state() != Some(ExecutionState::Aborted) {
        let message = format!("Got FAILED status in '{}' stage", stage_name(execution, stage));
        execution.status.execution_state = Some(ExecutionState::Failed);
        execution.status.conditions.set_false(ConditionType::Built);
        execution.status.conditions.set_message(ConditionType::Built, message);
    }
    stamp_started(execution, stage, step, started);
    execution.status.stages[stage].steps[step].ended = Some(ended);
    execution.status.stages[stage].ended.get_or_insert(ended);
    execution.status.ended.get_or_insert(ended);

    // Nothing after a failure will run.
    for stage_status in &mut execution.status.stages {
        if stage_status.state == Some(StepState::Waiting) {
            stage_status.state = None;
        }
        for step_status in &mut stage_status.steps {
            if step_status.state == Some(StepState::Waiting) {
                step_status.state = None;
            }
        }
    }

    for step_status in &mut execution.status.stages[stage].steps {
        if step_status.state == Some(StepState::Building) {
            step_status.state = Some(StepState::Aborted);
            step_status.ended = Some(ended);
        }
    }
}

pub fn building_step(
    execution: &mut PipelineExecution,
    stage: usize,
    step: usize,
    started: DateTime<Utc>,
) {
    execution.status.stages[stage].steps[step].state = Some(StepState::Building);
    if execution.status.stages[stage].state == Some(StepState::Waiting) {
        execution.status.stages[stage].state = Some(StepState::Building);
    }
    if execution.state() == Some(ExecutionState::Waiting) {
        execution.status.execution_state = Some(ExecutionState::Building);
    }
    stamp_started(execution, stage, step, started);

    let message = format!("Running '{}' stage", stage_name(execution, stage));
    let conditions = &mut execution.status.conditions;
    conditions.create_unknown_if_missing(ConditionType::Built);
    conditions.set_message(ConditionType::Built, message);
}

pub fn skip_step(execution: &mut PipelineExecution, stage: usize, step: usize, ended: DateTime<Utc>) {
    execution.status.stages[stage].steps[step].state = Some(StepState::Skipped);

    let stage_status = &mut execution.status.stages[stage];
    if stage_status
        .steps
        .iter()
        .all(|s| s.state == Some(StepState::Skipped))
    {
        stage_status.state = Some(StepState::Skipped);
    } else if stage_status.is_success() {
        stage_status.state = Some(StepState::Success);
        stage_status.ended = Some(ended);
    }

    let settled = matches!(
        execution.status.stages[stage].state,
        Some(StepState::Skipped | StepState::Success)
    );
    if is_last_stage(execution, stage) && settled {
        finish_success(execution, ended);
    }
}

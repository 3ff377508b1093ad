//! Execution inspection and control: `list`, `show`, `abort`, `log`.

use anyhow::{Context, Result, bail};

use conveyor::config::OrchestratorConfig;
use conveyor::engine::{LocalEngine, PipelineEngine};
use conveyor::store::{Store, StoreExt};
use conveyor_common::pipeline::{ExecutionState, FINISH_LABEL, FinishMark};
use conveyor_common::{ConditionType, LabelSelector, PipelineExecution};

use super::open_stores;

fn styled_state(execution: &PipelineExecution) -> console::StyledObject<&'static str> {
    let state = execution.state().map(|s| s.as_str()).unwrap_or("-");
    match execution.state() {
        Some(ExecutionState::Success) => console::style(state).green(),
        Some(ExecutionState::Failed) => console::style(state).red(),
        Some(ExecutionState::Aborted) => console::style(state).yellow(),
        Some(ExecutionState::Building) => console::style(state).cyan(),
        _ => console::style(state).dim(),
    }
}

pub async fn cmd_list(config: &OrchestratorConfig, project: Option<&str>, active: bool) -> Result<()> {
    let stores = open_stores(config)?;
    let selector = if active {
        LabelSelector::eq(FINISH_LABEL, FinishMark::Active.label_value())
    } else {
        LabelSelector::everything()
    };
    let mut executions = stores.executions.list(project.unwrap_or(""), &selector).await?;
    executions.sort_by(|a, b| {
        a.metadata
            .creation_timestamp
            .cmp(&b.metadata.creation_timestamp)
    });

    if executions.is_empty() {
        println!("No executions found.");
        return Ok(());
    }

    println!(
        "{:<16} {:<28} {:<6} {:<10} Message",
        "Namespace", "Name", "Run", "State"
    );
    for e in &executions {
        let conditions = &e.status.conditions;
        let message = [
            ConditionType::Built,
            ConditionType::Provisioned,
            ConditionType::Initialized,
        ]
        .into_iter()
        .map(|kind| conditions.message(kind))
        .find(|m| !m.is_empty())
        .unwrap_or("");
        println!(
            "{:<16} {:<28} {:<6} {:<10} {}",
            e.metadata.namespace,
            e.metadata.name,
            e.spec.run,
            styled_state(e),
            message
        );
    }
    Ok(())
}

pub async fn cmd_show(config: &OrchestratorConfig, namespace: &str, name: &str) -> Result<()> {
    let stores = open_stores(config)?;
    let Some(execution) = stores.executions.get_optional(namespace, name).await? else {
        bail!("Execution {}:{} not found", namespace, name);
    };
    let yaml = serde_yaml::to_string(&execution).context("Failed to render execution")?;
    print!("{}", yaml);
    Ok(())
}

pub async fn cmd_abort(config: &OrchestratorConfig, namespace: &str, name: &str) -> Result<()> {
    let stores = open_stores(config)?;
    let Some(mut execution) = stores.executions.get_optional(namespace, name).await? else {
        bail!("Execution {}:{} not found", namespace, name);
    };
    if execution.is_terminal() {
        println!(
            "Execution {}:{} already ended in {}",
            namespace,
            name,
            styled_state(&execution)
        );
        return Ok(());
    }

    execution.status.execution_state = Some(ExecutionState::Aborted);
    stores
        .executions
        .update(execution)
        .await
        .with_context(|| format!("Failed to abort {}:{}", namespace, name))?;
    println!("Aborted {}", console::style(format!("{}:{}", namespace, name)).yellow());
    Ok(())
}

pub async fn cmd_log(
    config: &OrchestratorConfig,
    namespace: &str,
    name: &str,
    stage: usize,
    step: usize,
) -> Result<()> {
    let stores = open_stores(config)?;
    let Some(execution) = stores.executions.get_optional(namespace, name).await? else {
        bail!("Execution {}:{} not found", namespace, name);
    };
    let engine = LocalEngine::new(config.engine.workspace_dir.clone());
    let log = engine.get_step_log(&execution, stage, step).await?;
    print!("{}", log);
    Ok(())
}

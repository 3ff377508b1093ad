//! Pipeline management and execution submission.

use anyhow::{Context, Result, bail};
use std::path::Path;

use conveyor::config::OrchestratorConfig;
use conveyor::store::{Store, StoreExt};
pub use conveyor_common::pipeline::Provenance;
use conveyor_common::pipeline::PipelineSpec;
use conveyor_common::{LabelSelector, ObjectMeta, Pipeline, PipelineConfig, ProjectRef};

use super::open_stores;

pub async fn cmd_pipeline_create(
    config: &OrchestratorConfig,
    namespace: &str,
    name: &str,
    project: &str,
    repo: &str,
) -> Result<()> {
    let project_ref: ProjectRef = project.parse()?;
    if project_ref.project_id != namespace {
        bail!(
            "Pipelines of project {} must live in namespace '{}', not '{}'",
            project_ref,
            project_ref.project_id,
            namespace
        );
    }

    let stores = open_stores(config)?;
    let pipeline = Pipeline {
        metadata: ObjectMeta::new(namespace, name),
        spec: PipelineSpec {
            project_name: project_ref.to_string(),
            display_name: name.to_string(),
            repository_url: repo.to_string(),
        },
        status: Default::default(),
    };
    stores
        .pipelines
        .create(pipeline)
        .await
        .with_context(|| format!("Failed to create pipeline {}:{}", namespace, name))?;
    println!("Created pipeline {}", console::style(format!("{}:{}", namespace, name)).green());
    Ok(())
}

pub async fn cmd_pipeline_list(config: &OrchestratorConfig, project: Option<&str>) -> Result<()> {
    let stores = open_stores(config)?;
    let pipelines = stores
        .pipelines
        .list(project.unwrap_or(""), &LabelSelector::everything())
        .await?;

    if pipelines.is_empty() {
        println!("No pipelines found.");
        return Ok(());
    }
    println!(
        "{:<16} {:<24} {:<8} {:<10} Last execution",
        "Namespace", "Name", "Next", "State"
    );
    for p in &pipelines {
        let state = p
            .status
            .last_run_state
            .map(|s| s.as_str())
            .unwrap_or("-");
        println!(
            "{:<16} {:<24} {:<8} {:<10} {}",
            p.metadata.namespace, p.metadata.name, p.status.next_run, state, p.status.last_execution_id
        );
    }
    Ok(())
}

pub async fn cmd_run(
    config: &OrchestratorConfig,
    namespace: &str,
    pipeline: &str,
    file: &Path,
    provenance: Provenance,
) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read pipeline config: {}", file.display()))?;
    let pipeline_config: PipelineConfig = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse pipeline config: {}", file.display()))?;
    if pipeline_config.stages.is_empty() {
        bail!("Pipeline config {} has no stages", file.display());
    }

    let stores = open_stores(config)?;
    let Some(parent) = stores.pipelines.get_optional(namespace, pipeline).await? else {
        bail!("Pipeline {}:{} not found", namespace, pipeline);
    };

    let execution = parent.new_execution(pipeline_config, provenance);
    let name = execution.metadata.name.clone();
    stores.executions.create(execution).await.with_context(|| {
        format!(
            "Failed to submit run {} of {}:{}",
            parent.status.next_run, namespace, pipeline
        )
    })?;
    println!("Submitted {}", console::style(format!("{}:{}", namespace, name)).green());
    Ok(())
}

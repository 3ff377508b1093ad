//! Settings and notifier registration.

use anyhow::{Context, Result};

use conveyor::config::OrchestratorConfig;
use conveyor::settings::parse_quota;
use conveyor::store::{Store, StoreExt};
use conveyor_common::setting::EXECUTOR_QUOTA;
use conveyor_common::{Notifier, NotifierKind, ObjectMeta, PipelineSetting};

use super::open_stores;

pub async fn cmd_setting_set(config: &OrchestratorConfig, project: &str, name: &str, value: &str) -> Result<()> {
    if name == EXECUTOR_QUOTA && parse_quota(value).is_none() {
        println!(
            "{} '{}' is not a positive integer; executions of {} will be unlimited",
            console::style("warning:").yellow(),
            value,
            project
        );
    }

    let stores = open_stores(config)?;
    let desired = PipelineSetting::new(project, name, value);
    let (existing, created) = stores.settings.create_if_absent(desired.clone()).await?;
    if !created {
        let mut updated = existing;
        updated.value = desired.value;
        stores
            .settings
            .update(updated)
            .await
            .with_context(|| format!("Failed to update setting {}:{}", project, name))?;
    }
    println!("Set {} = {} for project {}", name, console::style(value).green(), project);
    Ok(())
}

pub async fn cmd_notifier_add(
    config: &OrchestratorConfig,
    cluster: &str,
    name: &str,
    display_name: &str,
    kind: NotifierKind,
) -> Result<()> {
    let stores = open_stores(config)?;
    let notifier = Notifier {
        metadata: ObjectMeta::new(cluster, name),
        display_name: display_name.to_string(),
        kind,
    };
    stores
        .notifiers
        .create(notifier)
        .await
        .with_context(|| format!("Failed to register notifier {}:{}", cluster, name))?;
    println!("Registered notifier {}", console::style(format!("{}:{}", cluster, name)).green());
    Ok(())
}

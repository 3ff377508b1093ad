//! `conveyor init`.

use anyhow::{Context, Result};
use std::path::Path;

use conveyor::config::OrchestratorConfig;

use super::open_stores;

pub fn cmd_init(config_path: &Path, config: &OrchestratorConfig, force: bool) -> Result<()> {
    if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    if config_path.exists() && !force {
        println!(
            "{} already exists, keeping it (use --force to overwrite)",
            config_path.display()
        );
    } else {
        config.save(config_path)?;
        println!("Wrote {}", console::style(config_path.display()).green());
    }

    open_stores(config)?;
    println!(
        "Object database ready at {}",
        console::style(config.store.db_path.display()).green()
    );
    println!();
    println!("Next steps:");
    println!("  1. conveyor pipeline create <project> <name> --project <cluster>:<project> --repo <url>");
    println!("  2. conveyor controller");
    println!("  3. conveyor run <project> <name> --file pipeline.yaml");
    Ok(())
}

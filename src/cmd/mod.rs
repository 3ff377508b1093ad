//! CLI command implementations.
//!
//! | Module       | Commands handled                                  |
//! |--------------|----------------------------------------------------|
//! | `init`       | `Init`                                             |
//! | `controller` | `Controller`                                       |
//! | `pipeline`   | `Pipeline`, `Run`                                  |
//! | `execution`  | `List`, `Show`, `Abort`, `Log`                     |
//! | `admin`      | `Setting`, `Notifier`                              |

pub mod admin;
pub mod controller;
pub mod execution;
pub mod init;
pub mod pipeline;

use anyhow::{Context, Result};
use conveyor::config::OrchestratorConfig;
use conveyor::store::{DbHandle, ObjectDb, Stores};

pub use admin::{cmd_notifier_add, cmd_setting_set};
pub use controller::cmd_controller;
pub use execution::{cmd_abort, cmd_list, cmd_log, cmd_show};
pub use init::cmd_init;
pub use pipeline::{Provenance, cmd_pipeline_create, cmd_pipeline_list, cmd_run};

/// Open the object database named by the configuration.
pub fn open_stores(config: &OrchestratorConfig) -> Result<Stores> {
    let path = &config.store.db_path;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let db = ObjectDb::new(path)
        .with_context(|| format!("Failed to open database at {}", path.display()))?;
    Ok(Stores::sqlite(DbHandle::new(db)))
}

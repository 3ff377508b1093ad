//! Role bindings granting the runner access to its project's namespaces.

use conveyor_common::LabelSelector;
use tracing::debug;

use crate::errors::ProvisionError;
use crate::provision::resources::{
    self, PROJECT_ID_LABEL, ROLE_CREATE_NS, ROLE_EDIT_NS_SUFFIX, pipeline_namespace_name,
};
use crate::store::{Store, StoreExt, Stores};

/// Whether a namespace's project annotation (`"<cluster>:<project>"`) names `project_id`.
fn belongs_to(annotation: Option<&str>, project_id: &str) -> bool {
    match annotation.map(|value| value.split(':').collect::<Vec<_>>()) {
        Some(parts) => parts.len() == 2 && parts[1] == project_id,
        None => false,
    }
}

/// Bind the runner service account as admin in every namespace of the
/// project, drop bindings from namespaces that left it, and ensure the two
/// cluster role bindings exist.
pub async fn reconcile_role_bindings(stores: &Stores, project_id: &str) -> Result<(), ProvisionError> {
    let common_name = pipeline_namespace_name(project_id);

    let namespaces = stores.namespaces.list("", &LabelSelector::everything()).await?;
    for ns in &namespaces {
        let name = &ns.metadata.name;
        if belongs_to(ns.metadata.annotation(PROJECT_ID_LABEL), project_id) {
            let (_, created) = stores
                .role_bindings
                .create_if_absent(resources::role_binding(name, &common_name))
                .await?;
            if created {
                debug!(namespace = %name, project = %project_id, "Bound runner to namespace");
            }
        } else if stores.role_bindings.delete_if_present(name, &common_name).await? {
            debug!(namespace = %name, project = %project_id, "Removed stale runner binding");
        }
    }

    let edit_role = format!("{}{}", project_id, ROLE_EDIT_NS_SUFFIX);
    for role in [ROLE_CREATE_NS, edit_role.as_str()] {
        stores
            .cluster_role_bindings
            .create_if_absent(resources::cluster_role_binding(&common_name, role))
            .await?;
    }
    Ok(())
}

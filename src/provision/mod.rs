//! Per-project pipeline infrastructure.
//!
//! `Provisioner::deploy` brings up everything a project's executions need:
//! the dedicated namespace, runner credentials, the registry with its TLS
//! certificate, the object store, a host port on the shared registry proxy
//! and the runner's role bindings. Every step tolerates objects that already
//! exist. Once the pipeline namespace exists, later deploys only reconcile
//! role bindings, so a deploy that failed after creating the namespace is
//! not completed by running it again.

pub mod accounts;
pub mod certs;
pub mod ports;
pub mod rbac;
pub mod resources;

use std::sync::Arc;

use chrono::Utc;
use conveyor_common::cluster::{QUOTA_INIT, QUOTA_VALIDATED, Secret};
use conveyor_common::{ConditionStatus, LabelSelector, ProjectRef};
use rand::RngCore;
use rand::rngs::OsRng;
use tracing::{debug, info, warn};

use crate::config::ProvisionerSection;
use crate::errors::{ProvisionError, StoreError};
use crate::settings::SettingsReader;
use crate::store::{Store, StoreExt, Stores};

pub use accounts::{StoredSystemAccounts, SystemAccounts};
pub use certs::CertificateAuthority;
pub use ports::{PortAllocator, PortRange};
pub use rbac::reconcile_role_bindings;
use resources::{
    COMMON_NAMESPACE, DEFAULT_TOKEN, DEFAULT_USER, LABEL_APP, PIPELINE_NAMESPACE_LABEL,
    PIPELINE_SECRET, PROJECT_ID_LABEL, REGISTRY_CA_SECRET, REGISTRY_CRT_SECRET, REGISTRY_NAME,
    SECRET_TOKEN_KEY, pipeline_namespace_name,
};

const TOKEN_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const TOKEN_LEN: usize = 48;
const REGISTRY_HASH_COST: u32 = 10;

/// Random alphanumeric token. Falls back to a fixed token when the OS
/// random source is unavailable.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_LEN];
    match OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => bytes
            .iter()
            .map(|b| TOKEN_CHARSET[*b as usize % TOKEN_CHARSET.len()] as char)
            .collect(),
        Err(e) => {
            warn!(error = %e, "Failed to generate pipeline token, using default");
            DEFAULT_TOKEN.to_string()
        }
    }
}

/// `user:bcrypt(token)`, the htpasswd line the registry authenticates against.
async fn registry_token(token: &str) -> Result<String, ProvisionError> {
    let token = token.to_string();
    let hashed = tokio::task::spawn_blocking(move || bcrypt::hash(token, REGISTRY_HASH_COST))
        .await
        .map_err(|e| anyhow::anyhow!("registry token hashing task failed: {}", e))??;
    Ok(format!("{}:{}", DEFAULT_USER, hashed))
}

pub struct Provisioner {
    stores: Stores,
    settings: SettingsReader,
    accounts: Arc<dyn SystemAccounts>,
    ports: PortAllocator,
    config: ProvisionerSection,
}

impl Provisioner {
    pub fn new(
        stores: Stores,
        settings: SettingsReader,
        accounts: Arc<dyn SystemAccounts>,
        config: ProvisionerSection,
    ) -> Result<Self, ProvisionError> {
        let range: PortRange = config.port_range.parse()?;
        let ports = PortAllocator::new(stores.config_maps.clone(), range);
        Ok(Self {
            stores,
            settings,
            accounts,
            ports,
            config,
        })
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Registry proxy port allocated to `project_id`, if any.
    pub async fn registry_port(&self, project_id: &str) -> Result<Option<u16>, StoreError> {
        self.ports.lookup(project_id).await
    }

    /// Ensure the project's pipeline infrastructure exists. When the pipeline
    /// namespace is already present only the role bindings are reconciled.
    pub async fn deploy(&self, project: &ProjectRef) -> Result<(), ProvisionError> {
        let project_id = project.project_id.as_str();
        let ns = pipeline_namespace_name(project_id);

        if self.stores.namespaces.get_optional("", &ns).await?.is_some() {
            return reconcile_role_bindings(&self.stores, project_id).await;
        }

        info!(project = %project, namespace = %ns, "Deploying pipeline infrastructure");
        self.stores
            .namespaces
            .create_if_absent(resources::pipeline_namespace(project))
            .await?;
        self.wait_quota_settled(&ns).await?;

        self.stores
            .namespaces
            .create_if_absent(resources::common_namespace())
            .await?;
        let token = self.ensure_pipeline_secret(&ns).await?;

        let api_key = self.accounts.get_or_create_project_token(project_id).await?;
        self.stores
            .secrets
            .create_if_absent(resources::api_key_secret(&ns, &api_key))
            .await?;

        let ca = self.ensure_ca(&project.cluster_id).await?;
        self.ensure_registry_cert(project_id, &ns, &ca).await?;

        self.stores
            .service_accounts
            .create_if_absent(resources::service_account(&ns))
            .await?;
        self.stores
            .network_policies
            .create_if_absent(resources::network_policy(&ns))
            .await?;

        for service in [
            resources::runner_service(&ns),
            resources::registry_service(&ns),
            resources::object_store_service(&ns),
        ] {
            self.stores.services.create_if_absent(service).await?;
        }
        for workload in [
            resources::runner_deployment(&ns),
            resources::registry_deployment(&ns),
            resources::object_store_deployment(&ns),
        ] {
            self.stores.workloads.create_if_absent(workload).await?;
        }

        let port = self.ports.ensure(project_id).await?;
        self.reconcile_registry_credential(project, &token).await?;
        self.stores
            .workloads
            .create_if_absent(resources::proxy_daemonset())
            .await?;

        reconcile_role_bindings(&self.stores, project_id).await?;
        info!(project = %project, namespace = %ns, port, "Pipeline infrastructure ready");
        Ok(())
    }

    /// Wait for quota admission to settle on a freshly created namespace.
    /// Gives up quietly after the configured attempts; a rejected namespace
    /// is an error.
    async fn wait_quota_settled(&self, ns: &str) -> Result<(), ProvisionError> {
        for attempt in 1..=self.config.quota_settle_attempts {
            if let Some(namespace) = self.stores.namespaces.get_optional("", ns).await? {
                if let Some(cond) = namespace.condition(QUOTA_VALIDATED) {
                    if cond.status == ConditionStatus::False {
                        return Err(ProvisionError::QuotaExceeded {
                            namespace: ns.to_string(),
                            message: cond.message.clone(),
                        });
                    }
                }
                if namespace
                    .condition(QUOTA_INIT)
                    .is_some_and(|c| c.status == ConditionStatus::True)
                {
                    return Ok(());
                }
            }
            debug!(namespace = %ns, attempt, "Waiting for resource quota to settle");
            tokio::time::sleep(self.config.quota_settle_interval).await;
        }
        Ok(())
    }

    /// Create the runner secret, retrying transient failures. Returns the
    /// token actually stored, which is the existing one when another deploy
    /// got there first.
    async fn ensure_pipeline_secret(&self, ns: &str) -> Result<String, ProvisionError> {
        if let Some(token) = self.stored_token(ns).await? {
            return Ok(token);
        }

        let token = generate_token();
        let secret = resources::pipeline_secret(ns, &token, &registry_token(&token).await?);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.stores.secrets.create(secret.clone()).await {
                Ok(_) => return Ok(token),
                Err(e) if e.is_already_exists() => {
                    return self
                        .stored_token(ns)
                        .await?
                        .ok_or_else(|| anyhow::anyhow!("pipeline secret in {} has no token", ns).into());
                }
                Err(e) if attempt < self.config.secret_create_attempts => {
                    warn!(namespace = %ns, attempt, error = %e, "Failed to create pipeline secret, retrying");
                    tokio::time::sleep(self.config.quota_settle_interval).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn stored_token(&self, ns: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .stores
            .secrets
            .get_optional(ns, PIPELINE_SECRET)
            .await?
            .and_then(|s| s.get(SECRET_TOKEN_KEY).map(str::to_string)))
    }

    /// The cluster's registry CA, generated on first use.
    async fn ensure_ca(&self, cluster_id: &str) -> Result<CertificateAuthority, ProvisionError> {
        if let Some(secret) = self.stores.secrets.get_optional(cluster_id, REGISTRY_CA_SECRET).await? {
            return CertificateAuthority::from_secret(&secret);
        }
        let ca = CertificateAuthority::generate(Utc::now())?;
        let (stored, created) = self.stores.secrets.create_if_absent(ca.to_secret(cluster_id)).await?;
        if created {
            info!(cluster = %cluster_id, "Generated registry CA");
        }
        CertificateAuthority::from_secret(&stored)
    }

    async fn ensure_registry_cert(
        &self,
        project_id: &str,
        ns: &str,
        ca: &CertificateAuthority,
    ) -> Result<(), ProvisionError> {
        if self.stores.secrets.get_optional(ns, REGISTRY_CRT_SECRET).await?.is_some() {
            return Ok(());
        }
        self.publish_ca(ca).await?;
        let secret = self.issue_registry_cert(project_id, ns, ca).await?;
        self.stores.secrets.create_if_absent(secret).await?;
        Ok(())
    }

    /// Copy the CA certificate (without its key) to the proxy's namespace.
    async fn publish_ca(&self, ca: &CertificateAuthority) -> Result<(), ProvisionError> {
        let (existing, created) = self
            .stores
            .secrets
            .create_if_absent(ca.public_secret(COMMON_NAMESPACE))
            .await?;
        if !created && existing.get(certs::CA_CERT_KEY) != Some(ca.cert_pem.as_str()) {
            let mut updated = existing;
            updated.data = ca.public_secret(COMMON_NAMESPACE).data;
            self.stores.secrets.update(updated).await?;
        }
        Ok(())
    }

    async fn issue_registry_cert(
        &self,
        project_id: &str,
        ns: &str,
        ca: &CertificateAuthority,
    ) -> Result<Secret, ProvisionError> {
        let validity = self.settings.signing_duration(project_id).await;
        let issued = ca.issue(REGISTRY_NAME, certs::registry_dns_names(ns), validity, Utc::now())?;
        Ok(certs::registry_cert_secret(ns, ca, &issued))
    }

    /// Pull credential for `127.0.0.1:<port>` in the project's namespace.
    /// Requires the port to be allocated already.
    async fn reconcile_registry_credential(
        &self,
        project: &ProjectRef,
        token: &str,
    ) -> Result<(), ProvisionError> {
        let port = self.ports.lookup(&project.project_id).await?.ok_or_else(|| {
            anyhow::anyhow!("no registry port allocated for project {}", project.project_id)
        })?;
        let desired = resources::registry_credential(project, token, &format!("127.0.0.1:{}", port));

        let (existing, created) = self.stores.secrets.create_if_absent(desired.clone()).await?;
        if !created && existing.data != desired.data {
            let mut updated = existing;
            updated.data = desired.data;
            updated.secret_type = desired.secret_type;
            self.stores.secrets.update(updated).await?;
        }
        Ok(())
    }

    /// Projects with a deployed pipeline namespace.
    pub async fn provisioned_projects(&self) -> Result<Vec<ProjectRef>, StoreError> {
        let namespaces = self
            .stores
            .namespaces
            .list("", &LabelSelector::eq(PIPELINE_NAMESPACE_LABEL, "true"))
            .await?;
        Ok(namespaces
            .iter()
            .filter_map(|ns| ns.metadata.annotation(PROJECT_ID_LABEL))
            .filter_map(|value| value.parse::<ProjectRef>().ok())
            .collect())
    }

    /// Re-issue the project's registry certificate when it is close to
    /// expiry and bounce the registry pods so they pick it up. Returns
    /// whether a new certificate was issued.
    pub async fn rotate_registry_cert(&self, project: &ProjectRef) -> Result<bool, ProvisionError> {
        let ns = pipeline_namespace_name(&project.project_id);
        let Some(current) = self.stores.secrets.get_optional(&ns, REGISTRY_CRT_SECRET).await? else {
            return Ok(false);
        };
        if !certs::needs_rotation(&current, Utc::now()) {
            return Ok(false);
        }

        let ca = self.ensure_ca(&project.cluster_id).await?;
        self.publish_ca(&ca).await?;
        let fresh = self.issue_registry_cert(&project.project_id, &ns, &ca).await?;
        let mut updated = current;
        updated.data = fresh.data;
        updated.metadata.annotations = fresh.metadata.annotations;
        self.stores.secrets.update(updated).await?;

        let pods = self
            .stores
            .pods
            .list(&ns, &LabelSelector::eq(LABEL_APP, REGISTRY_NAME))
            .await?;
        for pod in pods {
            self.stores.pods.delete_if_present(&ns, &pod.metadata.name).await?;
        }
        info!(project = %project, namespace = %ns, "Rotated registry certificate");
        Ok(true)
    }
}

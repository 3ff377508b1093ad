//! System account tokens handed to pipeline runners.

use async_trait::async_trait;
use conveyor_common::cluster::{Secret, SecretType};

use crate::errors::ProvisionError;
use crate::provision::generate_token;
use crate::store::{SharedStore, StoreExt};

pub const SYSTEM_NAMESPACE: &str = "conveyor-system";
const TOKEN_KEY: &str = "token";

/// Source of per-project API tokens.
#[async_trait]
pub trait SystemAccounts: Send + Sync {
    async fn get_or_create_project_token(&self, project_id: &str) -> Result<String, ProvisionError>;
}

/// Keeps one token secret per project in the system namespace.
pub struct StoredSystemAccounts {
    secrets: SharedStore<Secret>,
}

impl StoredSystemAccounts {
    pub fn new(secrets: SharedStore<Secret>) -> Self {
        Self { secrets }
    }
}

fn account_name(project_id: &str) -> String {
    format!("pipeline-account-{}", project_id)
}

#[async_trait]
impl SystemAccounts for StoredSystemAccounts {
    async fn get_or_create_project_token(&self, project_id: &str) -> Result<String, ProvisionError> {
        let candidate = Secret::new(SYSTEM_NAMESPACE, &account_name(project_id), SecretType::Opaque)
            .with_data(TOKEN_KEY, generate_token());
        let (secret, _) = self.secrets.create_if_absent(candidate).await?;
        secret
            .get(TOKEN_KEY)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("account secret for {} has no token", project_id).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_token_is_stable_per_project() {
        let accounts = StoredSystemAccounts::new(Arc::new(MemoryStore::new()));
        let first = accounts.get_or_create_project_token("p-1").await.unwrap();
        assert!(!first.is_empty());
        assert_eq!(accounts.get_or_create_project_token("p-1").await.unwrap(), first);
        assert_ne!(accounts.get_or_create_project_token("p-2").await.unwrap(), first);
    }
}

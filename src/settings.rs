//! Per-project pipeline settings.

use std::time::Duration;

use chrono::Utc;
use conveyor_common::setting::{EXECUTOR_QUOTA, SIGNING_DURATION};
use tracing::warn;

use crate::errors::StoreError;
use crate::provision::certs;
use crate::store::{SharedStore, StoreExt};
use conveyor_common::PipelineSetting;

/// Parse a quota value. Non-positive or unparsable means unlimited (`None`).
pub fn parse_quota(value: &str) -> Option<usize> {
    match value.trim().parse::<i64>() {
        Ok(quota) if quota > 0 => Some(quota as usize),
        _ => None,
    }
}

/// Read-through accessor for the settings a project may override.
#[derive(Clone)]
pub struct SettingsReader {
    store: SharedStore<PipelineSetting>,
    default_signing_duration: Duration,
}

impl SettingsReader {
    pub fn new(store: SharedStore<PipelineSetting>, default_signing_duration: Duration) -> Self {
        Self {
            store,
            default_signing_duration,
        }
    }

    async fn effective(&self, project_id: &str, name: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .store
            .get_optional(project_id, name)
            .await?
            .map(|s| s.effective().to_string()))
    }

    /// Maximum number of concurrently active executions, `None` for unlimited.
    pub async fn executor_quota(&self, project_id: &str) -> Result<Option<usize>, StoreError> {
        Ok(self
            .effective(project_id, EXECUTOR_QUOTA)
            .await?
            .as_deref()
            .and_then(parse_quota))
    }

    /// Registry certificate lifetime. Falls back to the configured default on
    /// a missing, unreadable or unparsable setting, and on one too long for a
    /// certificate to express.
    pub async fn signing_duration(&self, project_id: &str) -> Duration {
        let value = match self.effective(project_id, SIGNING_DURATION).await {
            Ok(Some(value)) => value,
            Ok(None) => return self.default_signing_duration,
            Err(e) => {
                warn!(project = %project_id, error = %e, "Failed to read signing duration setting");
                return self.default_signing_duration;
            }
        };
        match humantime::parse_duration(value.trim()) {
            Ok(duration) if !duration.is_zero() && certs::expiry(Utc::now(), duration).is_some() => {
                duration
            }
            _ => {
                warn!(project = %project_id, value = %value, "Invalid signing duration, using default");
                self.default_signing_duration
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Store};
    use std::sync::Arc;

    const DEFAULT: Duration = Duration::from_secs(8760 * 3600);

    fn reader() -> (SharedStore<PipelineSetting>, SettingsReader) {
        let store: SharedStore<PipelineSetting> = Arc::new(MemoryStore::new());
        (store.clone(), SettingsReader::new(store, DEFAULT))
    }

    #[test]
    fn test_parse_quota() {
        assert_eq!(parse_quota("2"), Some(2));
        assert_eq!(parse_quota(" 10 "), Some(10));
        assert_eq!(parse_quota("0"), None);
        assert_eq!(parse_quota("-1"), None);
        assert_eq!(parse_quota("many"), None);
        assert_eq!(parse_quota(""), None);
    }

    #[tokio::test]
    async fn test_missing_quota_is_unlimited() {
        let (_, reader) = reader();
        assert_eq!(reader.executor_quota("p-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_quota_uses_default_when_value_empty() {
        let (store, reader) = reader();
        let mut setting = PipelineSetting::new("p-1", EXECUTOR_QUOTA, "");
        setting.default = "3".to_string();
        store.create(setting).await.unwrap();
        assert_eq!(reader.executor_quota("p-1").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_signing_duration_falls_back() {
        let (store, reader) = reader();
        assert_eq!(reader.signing_duration("p-1").await, DEFAULT);

        store
            .create(PipelineSetting::new("p-1", SIGNING_DURATION, "not-a-duration"))
            .await
            .unwrap();
        assert_eq!(reader.signing_duration("p-1").await, DEFAULT);

        store
            .create(PipelineSetting::new("p-2", SIGNING_DURATION, "720h"))
            .await
            .unwrap();
        assert_eq!(
            reader.signing_duration("p-2").await,
            Duration::from_secs(720 * 3600)
        );
    }

    #[tokio::test]
    async fn test_signing_duration_beyond_certificate_range_falls_back() {
        let (store, reader) = reader();
        store
            .create(PipelineSetting::new("p-1", SIGNING_DURATION, "1000000years"))
            .await
            .unwrap();
        assert_eq!(reader.signing_duration("p-1").await, DEFAULT);
    }
}

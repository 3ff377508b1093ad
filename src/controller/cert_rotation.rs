//! Periodic registry certificate renewal.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::ControllerError;
use crate::provision::Provisioner;

pub struct CertRotator {
    provisioner: Arc<Provisioner>,
    interval: Duration,
}

impl CertRotator {
    pub fn new(provisioner: Arc<Provisioner>, interval: Duration) -> Self {
        Self {
            provisioner,
            interval,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match self.rotate_once().await {
                    Ok(0) => {}
                    Ok(rotated) => info!(rotated, "Registry certificates renewed"),
                    Err(e) => warn!(error = %e, "Certificate rotation pass failed"),
                },
            }
        }
        debug!("Certificate rotator stopped");
    }

    /// Check every provisioned project once. Returns how many certificates
    /// were re-issued.
    pub async fn rotate_once(&self) -> Result<usize, ControllerError> {
        let mut rotated = 0;
        for project in self.provisioner.provisioned_projects().await? {
            match self.provisioner.rotate_registry_cert(&project).await {
                Ok(true) => rotated += 1,
                Ok(false) => {}
                Err(e) => warn!(project = %project, error = %e, "Failed to rotate registry certificate"),
            }
        }
        Ok(rotated)
    }
}

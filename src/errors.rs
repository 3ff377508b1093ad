//! Typed error hierarchy for the orchestrator.
//!
//! One enum per subsystem:
//! - `StoreError`: persisted object boundary
//! - `EngineError`: execution backend
//! - `ProvisionError`: per-project infrastructure
//! - `NotifyError`: completion notifications
//!
//! `ControllerError` wraps them for the reconcile loops.

use conveyor_common::CommonError;
use thiserror::Error;

/// Errors from the persisted object store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: String },

    #[error("Conflict updating {kind} {key}: expected version {expected}, found {found}")]
    Conflict {
        kind: &'static str,
        key: String,
        expected: u64,
        found: u64,
    },

    #[error("Failed to (de)serialize object: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Errors from the pipeline engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Execution {0} is not running")]
    NotRunning(String),

    #[error("Execution {execution} has no step {stage}/{step}")]
    InvalidStep {
        execution: String,
        stage: usize,
        step: usize,
    },

    #[error("No log recorded for {0}")]
    NotFound(String),

    #[error("Engine I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine error: {0}")]
    Backend(String),
}

/// Errors from provisioning project infrastructure.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(
        "available resource quota in this project does not fit for the dedicated pipeline namespace {namespace}: {message}"
    )]
    QuotaExceeded { namespace: String, message: String },

    #[error("No available port in range {0}")]
    NoAvailablePort(String),

    #[error("Invalid port range '{0}'")]
    InvalidPortRange(String),

    #[error("Port allocation for {project} did not settle after {attempts} attempts")]
    PortContention { project: String, attempts: u32 },

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Failed to hash registry credential: {0}")]
    Credential(#[from] bcrypt::BcryptError),

    #[error(transparent)]
    Common(#[from] CommonError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<rcgen::Error> for ProvisionError {
    fn from(err: rcgen::Error) -> Self {
        ProvisionError::Certificate(err.to_string())
    }
}

/// Errors from notification delivery.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Notifier {0} uses a channel this sender cannot deliver to")]
    UnsupportedChannel(String),

    #[error("Delivery via {notifier} failed: {message}")]
    Delivery { notifier: String, message: String },

    #[error("Notifier {0} not found")]
    NotifierNotFound(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors surfaced by the reconcile loops.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Notify(#[from] NotifyError),

    #[error(transparent)]
    Common(#[from] CommonError),
}

impl ControllerError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, ControllerError::Store(e) if e.is_conflict())
    }
}

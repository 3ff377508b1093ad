//! Reconcile loops for pipeline executions.
//!
//! Two loops share the execution objects:
//! - the event-driven lifecycle reconciler ([`ExecutionLifecycle`]), fed by
//!   the store's watch stream plus a periodic full resync
//! - the periodic [`StateSyncer`], which polls the engine for executions
//!   whose progress produces no store events
//!
//! Both recompute from the object's current persisted state on every pass
//! and write back only when something changed, so either may run again at
//! any time. Write conflicts are dropped; the next event or tick retries.

pub mod cert_rotation;
pub mod lifecycle;
pub mod queue;
pub mod syncer;

use std::sync::Arc;

use conveyor_common::{LabelSelector, Object, Pipeline, PipelineExecution, parse_ref};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ControllerSection, OrchestratorConfig};
use crate::engine::PipelineEngine;
use crate::errors::{ControllerError, ProvisionError, StoreError};
use crate::notify::{MessageSender, NotificationService};
use crate::provision::{Provisioner, StoredSystemAccounts};
use crate::settings::SettingsReader;
use crate::store::{SharedStore, StoreExt, Stores, WatchEvent};

pub use cert_rotation::CertRotator;
pub use lifecycle::ExecutionLifecycle;
pub use queue::ExecutionQueue;
pub use syncer::StateSyncer;

/// Attempts per reconcile trigger before leaving the key to the next resync.
const MAX_RECONCILE_ATTEMPTS: u32 = 5;

/// A terminal state or a failing `Initialized`, `Provisioned` or `Built`
/// condition marks the execution finished in the same write that records it.
fn finish_if_settled(execution: &mut PipelineExecution) {
    let settled = execution.is_terminal() || execution.status.conditions.any_failed();
    if settled && !execution.is_finished() {
        execution.mark_finished();
    }
}

/// Write `execution` back when it differs from `original`. Returns the
/// stored copy (or `execution` unchanged when nothing was written).
pub(crate) async fn persist(
    store: &SharedStore<PipelineExecution>,
    original: &PipelineExecution,
    mut execution: PipelineExecution,
) -> Result<PipelineExecution, StoreError> {
    finish_if_settled(&mut execution);
    if &execution == original {
        return Ok(execution);
    }
    store.update(execution).await
}

async fn parent_pipeline(
    pipelines: &SharedStore<Pipeline>,
    execution: &PipelineExecution,
) -> Result<Option<Pipeline>, StoreError> {
    let (namespace, name) = parse_ref(&execution.spec.pipeline_name);
    let pipeline = pipelines.get_optional(namespace, name).await?;
    if pipeline.is_none() {
        debug!(execution = %execution.key(), pipeline = %execution.spec.pipeline_name, "Parent pipeline not found");
    }
    Ok(pipeline)
}

/// Advance the parent pipeline's run counter when `execution` carries its
/// next run number, and mirror the state when it is the last execution.
pub(crate) async fn update_pipeline_run(
    pipelines: &SharedStore<Pipeline>,
    execution: &PipelineExecution,
) -> Result<(), StoreError> {
    let Some(mut pipeline) = parent_pipeline(pipelines, execution).await? else {
        return Ok(());
    };
    let original = pipeline.clone();
    let reference = execution.reference();

    if execution.spec.run == pipeline.status.next_run {
        pipeline.status.next_run += 1;
        pipeline.status.last_execution_id = reference.clone();
        pipeline.status.last_started = execution.status.started;
    }
    if pipeline.status.last_execution_id == reference {
        pipeline.status.last_run_state = execution.state();
        if execution.status.started.is_some() {
            pipeline.status.last_started = execution.status.started;
        }
    }

    if pipeline != original {
        pipelines.update(pipeline).await?;
    }
    Ok(())
}

/// Copy the execution state onto the parent pipeline when this execution
/// is its last one.
pub(crate) async fn update_last_run_state(
    pipelines: &SharedStore<Pipeline>,
    execution: &PipelineExecution,
) -> Result<(), StoreError> {
    let Some(mut pipeline) = parent_pipeline(pipelines, execution).await? else {
        return Ok(());
    };
    if pipeline.status.last_execution_id != execution.reference()
        || pipeline.status.last_run_state == execution.state()
    {
        return Ok(());
    }
    pipeline.status.last_run_state = execution.state();
    pipelines.update(pipeline).await?;
    Ok(())
}

/// Whether `execution` belongs to the cluster this controller manages.
/// Malformed project references are kept so the reconciler can fail them.
fn in_scope(cluster_name: &str, execution: &PipelineExecution) -> bool {
    match execution.project() {
        Ok(project) => project.cluster_id == cluster_name,
        Err(_) => true,
    }
}

fn oldest_first(a: &PipelineExecution, b: &PipelineExecution) -> std::cmp::Ordering {
    a.metadata
        .creation_timestamp
        .cmp(&b.metadata.creation_timestamp)
        .then_with(|| a.metadata.name.cmp(&b.metadata.name))
}

/// Runs the lifecycle reconciler, the state syncer and the certificate
/// rotator until cancelled.
pub struct Controller {
    executions: SharedStore<PipelineExecution>,
    lifecycle: Arc<ExecutionLifecycle>,
    syncer: Arc<StateSyncer>,
    rotator: Arc<CertRotator>,
    config: ControllerSection,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Controller {
    pub fn new(
        stores: &Stores,
        lifecycle: ExecutionLifecycle,
        syncer: StateSyncer,
        rotator: CertRotator,
        config: ControllerSection,
    ) -> Self {
        Self {
            executions: stores.executions.clone(),
            lifecycle: Arc::new(lifecycle),
            syncer: Arc::new(syncer),
            rotator: Arc::new(rotator),
            config,
            locks: DashMap::new(),
        }
    }

    /// Wire the loops together from configuration. The engine and message
    /// sender are injected so tests can script them.
    pub fn assemble(
        stores: Stores,
        engine: Arc<dyn PipelineEngine>,
        sender: Arc<dyn MessageSender>,
        config: &OrchestratorConfig,
    ) -> Result<Self, ProvisionError> {
        let settings = SettingsReader::new(
            stores.settings.clone(),
            config.provisioner.default_signing_duration,
        );
        let accounts = Arc::new(StoredSystemAccounts::new(stores.secrets.clone()));
        let provisioner = Arc::new(Provisioner::new(
            stores.clone(),
            settings.clone(),
            accounts,
            config.provisioner.clone(),
        )?);
        let notifications = Arc::new(NotificationService::new(
            stores.executions.clone(),
            stores.notifiers.clone(),
            sender,
            config.server.url.clone(),
        ));
        let queue = ExecutionQueue::new(stores.executions.clone(), settings);

        let lifecycle = ExecutionLifecycle::new(
            stores.clone(),
            engine.clone(),
            provisioner.clone(),
            notifications,
            queue,
        );
        let syncer = StateSyncer::new(
            stores.executions.clone(),
            stores.pipelines.clone(),
            engine,
            config.controller.cluster_name.clone(),
            config.controller.sync_interval,
        );
        let rotator = CertRotator::new(provisioner, config.controller.cert_check_interval);
        Ok(Self::new(&stores, lifecycle, syncer, rotator, config.controller.clone()))
    }

    pub fn lifecycle(&self) -> &ExecutionLifecycle {
        &self.lifecycle
    }

    pub fn syncer(&self) -> &StateSyncer {
        &self.syncer
    }

    pub fn rotator(&self) -> &CertRotator {
        &self.rotator
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Reconcile the freshest copy of one execution. Passes for the same key
    /// never overlap.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<(), ControllerError> {
        let lock = self.key_lock(&conveyor_common::object_key(namespace, name));
        let _guard = lock.lock().await;

        let Some(execution) = self.executions.get_optional(namespace, name).await? else {
            return Ok(());
        };
        if !in_scope(&self.config.cluster_name, &execution) {
            return Ok(());
        }
        self.lifecycle.sync(execution).await?;
        Ok(())
    }

    async fn reconcile_with_retry(&self, namespace: &str, name: &str, cancel: &CancellationToken) {
        for attempt in 1..=MAX_RECONCILE_ATTEMPTS {
            match self.reconcile(namespace, name).await {
                Ok(()) => return,
                Err(e) if e.is_conflict() => {
                    debug!(execution = %name, namespace = %namespace, "Reconcile hit a write conflict, dropping");
                    return;
                }
                Err(e) => {
                    warn!(
                        execution = %name,
                        namespace = %namespace,
                        attempt,
                        error = %e,
                        "Reconcile failed"
                    );
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.retry_backoff) => {}
            }
        }
    }

    async fn on_deleted(&self, execution: &PipelineExecution) {
        if !in_scope(&self.config.cluster_name, execution) {
            return;
        }
        let lock = self.key_lock(&execution.key());
        {
            let _guard = lock.lock().await;
            if let Err(e) = self.lifecycle.remove(execution).await {
                warn!(execution = %execution.key(), error = %e, "Failed to finish removed execution");
            }
        }
        self.locks.remove(&execution.key());
    }

    /// Reconcile executions oldest first. Terminal ones are only included
    /// when `include_finished` is set, which the startup pass uses to catch
    /// finishes that happened while no controller was watching.
    pub async fn resync(&self, include_finished: bool, cancel: &CancellationToken) -> Result<usize, ControllerError> {
        let mut executions = self.executions.list("", &LabelSelector::everything()).await?;
        executions.retain(|e| include_finished || !e.is_finished());
        executions.sort_by(oldest_first);

        let count = executions.len();
        for execution in executions {
            if cancel.is_cancelled() {
                break;
            }
            self.reconcile_with_retry(execution.namespace(), execution.name(), cancel)
                .await;
        }
        Ok(count)
    }

    /// Run until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), ControllerError> {
        let mut events = self.executions.watch();
        info!(cluster = %self.config.cluster_name, "Pipeline execution controller started");

        let syncer = {
            let syncer = self.syncer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { syncer.run(cancel).await })
        };
        let rotator = {
            let rotator = self.rotator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { rotator.run(cancel).await })
        };

        match self.resync(true, &cancel).await {
            Ok(count) => info!(executions = count, "Initial resync complete"),
            Err(e) => warn!(error = %e, "Initial resync failed"),
        }

        let mut resync = tokio::time::interval(self.config.resync_interval);
        resync.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = resync.tick() => {
                    match self.resync(false, &cancel).await {
                        Ok(count) => debug!(executions = count, "Resync complete"),
                        Err(e) => warn!(error = %e, "Resync failed"),
                    }
                }
                event = events.recv() => match event {
                    Ok(WatchEvent::Added(execution)) | Ok(WatchEvent::Modified(execution)) => {
                        let this = self.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            this.reconcile_with_retry(execution.namespace(), execution.name(), &cancel)
                                .await;
                        });
                    }
                    Ok(WatchEvent::Deleted(execution)) => {
                        let this = self.clone();
                        tokio::spawn(async move { this.on_deleted(&execution).await });
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Execution watch lagged, resyncing");
                        resync.reset_immediately();
                    }
                    Err(RecvError::Closed) => {
                        warn!("Execution watch closed");
                        break;
                    }
                },
            }
        }

        cancel.cancel();
        let _ = syncer.await;
        let _ = rotator.await;
        info!("Pipeline execution controller stopped");
        Ok(())
    }
}

//! End-to-end scenarios for the reconcile loops against the in-memory store
//! and a scripted engine.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use conveyor::config::OrchestratorConfig;
use conveyor::controller::Controller;
use conveyor::controller::lifecycle::ABORTED_MESSAGE;
use conveyor::engine::PipelineEngine;
use conveyor::engine::progress::{building_step, finish_success};
use conveyor::errors::{EngineError, NotifyError};
use conveyor::notify::{Message, MessageSender, repo_name_from_url};
use conveyor::provision::resources::{LABEL_APP, LABEL_EXECUTION, RUNNER_NAME};
use conveyor::provision::ports::{PORT_MAP_CONFIGMAP, PORT_MAP_KEY};
use conveyor::provision::resources::COMMON_NAMESPACE;
use conveyor::provision::{PortAllocator, PortRange};
use conveyor::store::{Store, StoreExt, Stores};
use conveyor_common::cluster::{ConfigMap, Pod};
use conveyor_common::pipeline::{
    ExecutionState, FINISH_LABEL, FinishMark, PipelineNotification, PipelineSpec, Provenance,
    Recipient, Stage, Step, StepState,
};
use conveyor_common::setting::EXECUTOR_QUOTA;
use conveyor_common::{
    ConditionType, LabelSelector, Notifier, NotifierKind, ObjectMeta, Object, Pipeline,
    PipelineConfig, PipelineExecution, PipelineSetting,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

// =============================================
// Scripted collaborators
// =============================================

/// Engine whose progress is driven by the test.
#[derive(Default)]
struct ScriptedEngine {
    not_ready: AtomicBool,
    fail_precheck: AtomicBool,
    fail_run: AtomicBool,
    fail_sync: AtomicBool,
    /// Report success as soon as a started run is synced.
    auto_complete: AtomicBool,
    started: Mutex<Vec<String>>,
    stopped: Mutex<Vec<String>>,
    outcomes: Mutex<HashMap<String, ExecutionState>>,
}

impl ScriptedEngine {
    async fn complete(&self, name: &str, state: ExecutionState) {
        self.outcomes.lock().await.insert(format!("p-1/{}", name), state);
    }

    async fn started(&self) -> Vec<String> {
        self.started.lock().await.clone()
    }

    async fn stopped(&self) -> Vec<String> {
        self.stopped.lock().await.clone()
    }
}

#[async_trait]
impl PipelineEngine for ScriptedEngine {
    async fn pre_check(&self, _execution: &PipelineExecution) -> Result<bool, EngineError> {
        if self.fail_precheck.load(Ordering::SeqCst) {
            return Err(EngineError::Backend("engine unreachable".to_string()));
        }
        Ok(!self.not_ready.load(Ordering::SeqCst))
    }

    async fn run_pipeline_execution(&self, execution: &PipelineExecution) -> Result<(), EngineError> {
        if self.fail_run.load(Ordering::SeqCst) {
            return Err(EngineError::Backend("no runner available".to_string()));
        }
        let mut started = self.started.lock().await;
        if !started.contains(&execution.key()) {
            started.push(execution.key());
        }
        Ok(())
    }

    async fn rerun_execution(&self, execution: &PipelineExecution) -> Result<(), EngineError> {
        self.run_pipeline_execution(execution).await
    }

    async fn stop_execution(&self, execution: &PipelineExecution) -> Result<(), EngineError> {
        let running = self.started.lock().await.contains(&execution.key());
        if !running {
            return Err(EngineError::NotRunning(execution.key()));
        }
        self.stopped.lock().await.push(execution.key());
        Ok(())
    }

    async fn get_step_log(
        &self,
        _execution: &PipelineExecution,
        _stage: usize,
        _step: usize,
    ) -> Result<String, EngineError> {
        Ok(String::new())
    }

    async fn sync_execution(&self, execution: &mut PipelineExecution) -> Result<bool, EngineError> {
        if self.fail_sync.load(Ordering::SeqCst) {
            return Err(EngineError::Backend("engine lost the run".to_string()));
        }
        let outcome = self.outcomes.lock().await.get(&execution.key()).copied();
        let auto = self.auto_complete.load(Ordering::SeqCst);
        match outcome {
            Some(ExecutionState::Success) if execution.state() != Some(ExecutionState::Success) => {
                finish_success(execution, Utc::now());
                Ok(true)
            }
            // Terminal state reported with no condition recording why.
            Some(state) if state != ExecutionState::Success && execution.state() != Some(state) => {
                execution.status.execution_state = Some(state);
                Ok(true)
            }
            None if auto && execution.state() != Some(ExecutionState::Success) => {
                finish_success(execution, Utc::now());
                Ok(true)
            }
            _ if execution.state() == Some(ExecutionState::Waiting) => {
                building_step(execution, 0, 0, Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[derive(Default)]
struct RecordingSender {
    sent: std::sync::Mutex<Vec<(String, Message)>>,
}

impl RecordingSender {
    fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send(&self, _notifier: &Notifier, recipient: &str, message: &Message) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .unwrap()
            .push((recipient.to_string(), message.clone()));
        Ok(())
    }
}

// =============================================
// Harness
// =============================================

struct Harness {
    stores: Stores,
    engine: Arc<ScriptedEngine>,
    sender: Arc<RecordingSender>,
    controller: Arc<Controller>,
}

fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.controller.cluster_name = "c-1".to_string();
    config.controller.sync_interval = Duration::from_millis(20);
    config.controller.retry_backoff = Duration::from_millis(10);
    config.provisioner.port_range = "34000-34099".to_string();
    config.provisioner.quota_settle_attempts = 1;
    config.provisioner.quota_settle_interval = Duration::from_millis(1);
    config.server.url = "https://ci.example.com".to_string();
    config
}

async fn harness() -> Harness {
    let stores = Stores::in_memory();
    let engine = Arc::new(ScriptedEngine::default());
    let sender = Arc::new(RecordingSender::default());
    let controller = Controller::assemble(
        stores.clone(),
        engine.clone(),
        sender.clone(),
        &test_config(),
    )
    .unwrap();

    stores
        .pipelines
        .create(Pipeline {
            metadata: ObjectMeta::new("p-1", "demo"),
            spec: PipelineSpec {
                project_name: "c-1:p-1".to_string(),
                display_name: "demo".to_string(),
                repository_url: "https://git.example.com/acme/widgets.git".to_string(),
            },
            status: Default::default(),
        })
        .await
        .unwrap();

    Harness {
        stores,
        engine,
        sender,
        controller: Arc::new(controller),
    }
}

fn two_stage_config() -> PipelineConfig {
    PipelineConfig {
        stages: vec![
            Stage {
                name: "build".to_string(),
                steps: vec![Step::default()],
            },
            Stage {
                name: "test".to_string(),
                steps: vec![Step::default()],
            },
        ],
        ..Default::default()
    }
}

impl Harness {
    async fn set_quota(&self, quota: &str) {
        self.stores
            .settings
            .create(PipelineSetting::new("p-1", EXECUTOR_QUOTA, quota))
            .await
            .unwrap();
    }

    /// Submit run `run` of the demo pipeline, created `offset` seconds into the test.
    async fn submit(&self, run: u32, offset: i64) -> String {
        let name = format!("demo-{}", run);
        let mut exec = PipelineExecution {
            metadata: ObjectMeta::new("p-1", &name),
            ..Default::default()
        };
        exec.metadata.creation_timestamp =
            Some(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(offset));
        exec.spec.project_name = "c-1:p-1".to_string();
        exec.spec.pipeline_name = "p-1:demo".to_string();
        exec.spec.repository_url = "https://git.example.com/acme/widgets.git".to_string();
        exec.spec.run = run;
        exec.spec.pipeline_config = two_stage_config();
        self.stores.executions.create(exec).await.unwrap();
        name
    }

    /// Submit the pipeline's next run the way `conveyor run` does.
    async fn submit_next(&self) -> Result<String, conveyor::errors::StoreError> {
        let pipeline = self.stores.pipelines.get("p-1", "demo").await?;
        let exec = pipeline.new_execution(two_stage_config(), Provenance::default());
        let name = exec.metadata.name.clone();
        self.stores.executions.create(exec).await?;
        Ok(name)
    }

    async fn next_run(&self) -> u32 {
        self.stores.pipelines.get("p-1", "demo").await.unwrap().status.next_run
    }

    async fn reconcile(&self, name: &str) {
        self.controller.reconcile("p-1", name).await.unwrap();
    }

    async fn sync(&self) {
        self.controller.syncer().sync_once().await.unwrap();
    }

    async fn get(&self, name: &str) -> PipelineExecution {
        self.stores.executions.get("p-1", name).await.unwrap()
    }

    async fn active_count(&self) -> usize {
        self.stores
            .executions
            .list("p-1", &LabelSelector::eq(FINISH_LABEL, "false"))
            .await
            .unwrap()
            .len()
    }

    /// Admit `name` and drive it into `Building`.
    async fn start_building(&self, name: &str) {
        self.reconcile(name).await;
        self.sync().await;
        self.sync().await;
        assert_eq!(self.get(name).await.state(), Some(ExecutionState::Building));
    }
}

// =============================================
// Admission and queueing
// =============================================

#[tokio::test]
async fn test_admission_provisions_and_initializes() {
    let h = harness().await;
    let name = h.submit(1, 0).await;
    h.reconcile(&name).await;

    let exec = h.get(&name).await;
    assert_eq!(exec.state(), Some(ExecutionState::Waiting));
    assert_eq!(exec.finish_mark(), Some(FinishMark::Active));
    assert!(exec.status.conditions.is_unknown(ConditionType::Initialized));
    assert_eq!(exec.status.stages.len(), 2);
    assert!(exec.status.started.is_some());
    assert!(exec
        .metadata
        .annotation(conveyor_common::pipeline::LOCAL_REGISTRY_PORT_ANNOTATION)
        .is_some());
    assert!(h.stores.namespaces.get_optional("", "p-1-pipeline").await.unwrap().is_some());

    let pipeline = h.stores.pipelines.get("p-1", "demo").await.unwrap();
    assert_eq!(pipeline.status.next_run, 2);
    assert_eq!(pipeline.status.last_execution_id, "p-1:demo-1");
    assert_eq!(pipeline.status.last_run_state, Some(ExecutionState::Waiting));
}

#[tokio::test]
async fn test_reconcile_twice_is_a_no_op() {
    let h = harness().await;
    let name = h.submit(1, 0).await;
    h.reconcile(&name).await;
    let first = h.get(&name).await;
    h.reconcile(&name).await;
    let second = h.get(&name).await;
    assert_eq!(first.metadata.resource_version, second.metadata.resource_version);
}

#[tokio::test]
async fn test_quota_block_then_release() {
    let h = harness().await;
    h.set_quota("1").await;

    let a = h.submit(1, 0).await;
    h.start_building(&a).await;

    let b = h.submit(2, 10).await;
    h.reconcile(&b).await;
    let queued = h.get(&b).await;
    assert_eq!(queued.state(), Some(ExecutionState::Queueing));
    assert_eq!(queued.finish_mark(), Some(FinishMark::Queued));
    assert!(!queued.status.conditions.is_set(ConditionType::Initialized));
    assert_eq!(h.active_count().await, 1);

    h.engine.complete(&a, ExecutionState::Success).await;
    h.sync().await;
    assert!(h.get(&a).await.is_finished());

    // Finish path of A releases B.
    h.reconcile(&a).await;
    assert_eq!(h.get(&b).await.state(), Some(ExecutionState::Waiting));

    h.reconcile(&b).await;
    let admitted = h.get(&b).await;
    assert_eq!(admitted.finish_mark(), Some(FinishMark::Active));
    assert!(admitted.status.conditions.is_unknown(ConditionType::Initialized));
    assert_eq!(h.active_count().await, 1);
}

#[tokio::test]
async fn test_queue_releases_oldest_first() {
    let h = harness().await;
    h.set_quota("1").await;

    let a = h.submit(1, 0).await;
    h.start_building(&a).await;

    // Created in the order t1 < t2 < t3, reconciled out of order.
    let t3 = h.submit(4, 30).await;
    let t1 = h.submit(2, 10).await;
    let t2 = h.submit(3, 20).await;
    for name in [&t3, &t1, &t2] {
        h.reconcile(name).await;
        assert_eq!(h.get(name).await.state(), Some(ExecutionState::Queueing));
    }

    h.engine.complete(&a, ExecutionState::Success).await;
    h.sync().await;
    h.reconcile(&a).await;

    assert_eq!(h.get(&t1).await.state(), Some(ExecutionState::Waiting));
    assert_eq!(h.get(&t2).await.state(), Some(ExecutionState::Queueing));
    assert_eq!(h.get(&t3).await.state(), Some(ExecutionState::Queueing));

    // A younger execution cannot take the freed slot ahead of t1.
    h.reconcile(&t2).await;
    assert_eq!(h.get(&t2).await.finish_mark(), Some(FinishMark::Queued));

    h.reconcile(&t1).await;
    assert_eq!(h.get(&t1).await.finish_mark(), Some(FinishMark::Active));
}

#[tokio::test]
async fn test_queued_run_claims_its_run_number() {
    let h = harness().await;
    h.set_quota("1").await;

    let a = h.submit_next().await.unwrap();
    assert_eq!(a, "demo-1");
    h.start_building(&a).await;
    assert_eq!(h.next_run().await, 2);

    let b = h.submit_next().await.unwrap();
    assert_eq!(b, "demo-2");
    // Run 2 is taken until the controller has seen it.
    let duplicate = h.submit_next().await.unwrap_err();
    assert!(duplicate.is_already_exists());

    h.reconcile(&b).await;
    assert_eq!(h.get(&b).await.state(), Some(ExecutionState::Queueing));
    assert_eq!(h.next_run().await, 3);
    let pipeline = h.stores.pipelines.get("p-1", "demo").await.unwrap();
    assert_eq!(pipeline.status.last_execution_id, "p-1:demo-2");
    assert_eq!(pipeline.status.last_run_state, Some(ExecutionState::Queueing));

    let c = h.submit_next().await.unwrap();
    assert_eq!(c, "demo-3");
    h.reconcile(&c).await;
    assert_eq!(h.get(&c).await.state(), Some(ExecutionState::Queueing));
    assert_eq!(h.next_run().await, 4);
    assert_eq!(h.active_count().await, 1);
}

#[tokio::test]
async fn test_concurrent_admission_respects_quota() {
    let h = harness().await;
    h.set_quota("2").await;

    let mut names = Vec::new();
    for run in 1..=6 {
        names.push(h.submit(run, i64::from(run)).await);
    }
    let passes = names.iter().map(|name| {
        let controller = h.controller.clone();
        let name = name.clone();
        async move { controller.reconcile("p-1", &name).await }
    });
    for result in futures::future::join_all(passes).await {
        result.unwrap();
    }

    assert_eq!(h.active_count().await, 2);
    let queued = h
        .stores
        .executions
        .list("p-1", &LabelSelector::eq(FINISH_LABEL, ""))
        .await
        .unwrap();
    assert_eq!(queued.len(), 4);
}

#[tokio::test]
async fn test_invalid_project_reference_fails_terminally() {
    let h = harness().await;
    let mut exec = PipelineExecution {
        metadata: ObjectMeta::new("p-1", "broken-1"),
        ..Default::default()
    };
    exec.spec.project_name = "no-cluster".to_string();
    h.stores.executions.create(exec).await.unwrap();

    h.reconcile("broken-1").await;
    let exec = h.get("broken-1").await;
    assert_eq!(exec.state(), Some(ExecutionState::Failed));
    assert!(exec.status.conditions.is_false(ConditionType::Initialized));
    assert!(exec.is_finished());
    assert!(exec.status.ended.is_some());
}

#[tokio::test]
async fn test_provisioning_failure_fails_terminally() {
    let h = harness().await;
    // Every port in the configured range already belongs to another project.
    let taken: std::collections::BTreeMap<String, u16> = (0..100u16)
        .map(|i| (format!("p-other-{}", i), 34000 + i))
        .collect();
    let mut port_map = ConfigMap {
        metadata: ObjectMeta::new(COMMON_NAMESPACE, PORT_MAP_CONFIGMAP),
        ..Default::default()
    };
    port_map
        .data
        .insert(PORT_MAP_KEY.to_string(), serde_json::to_string(&taken).unwrap());
    h.stores.config_maps.create(port_map).await.unwrap();

    let name = h.submit(1, 0).await;
    h.reconcile(&name).await;

    let exec = h.get(&name).await;
    assert_eq!(exec.state(), Some(ExecutionState::Failed));
    assert!(exec.status.conditions.is_false(ConditionType::Initialized));
    assert!(exec
        .status
        .conditions
        .message(ConditionType::Initialized)
        .contains("34000-34099"));
    assert!(exec.is_finished());
    assert!(exec.status.ended.is_some());
    assert_eq!(h.active_count().await, 0);
    assert_eq!(h.controller.syncer().sync_once().await.unwrap(), 0);

    h.reconcile(&name).await;
    let pipeline = h.stores.pipelines.get("p-1", "demo").await.unwrap();
    assert_eq!(pipeline.status.last_run_state, Some(ExecutionState::Failed));
}

// =============================================
// State syncer
// =============================================

#[tokio::test]
async fn test_syncer_waits_for_engine_readiness() {
    let h = harness().await;
    h.engine.not_ready.store(true, Ordering::SeqCst);
    let name = h.submit(1, 0).await;
    h.reconcile(&name).await;
    h.sync().await;

    let exec = h.get(&name).await;
    assert!(exec.status.conditions.is_unknown(ConditionType::Initialized));
    assert_eq!(
        exec.status.conditions.message(ConditionType::Initialized),
        conveyor::controller::syncer::WAITING_MESSAGE
    );
    assert!(h.engine.started().await.is_empty());

    h.engine.not_ready.store(false, Ordering::SeqCst);
    h.sync().await;
    let exec = h.get(&name).await;
    assert!(exec.status.conditions.is_true(ConditionType::Initialized));
    assert_eq!(
        exec.status.conditions.message(ConditionType::Provisioned),
        conveyor::controller::syncer::ASSIGNING_MESSAGE
    );
    assert_eq!(h.engine.started().await, vec!["p-1/demo-1".to_string()]);
}

#[tokio::test]
async fn test_precheck_error_fails_and_finishes() {
    let h = harness().await;
    h.engine.fail_precheck.store(true, Ordering::SeqCst);
    let name = h.submit(1, 0).await;
    h.reconcile(&name).await;
    h.sync().await;

    let exec = h.get(&name).await;
    assert_eq!(exec.state(), Some(ExecutionState::Failed));
    assert!(exec.status.conditions.is_false(ConditionType::Built));
    assert!(exec.is_finished());
    assert!(exec.status.ended.is_some());

    // Terminal executions drop out of the syncer's scan.
    assert_eq!(h.controller.syncer().sync_once().await.unwrap(), 0);
}

#[tokio::test]
async fn test_success_updates_pipeline_last_run_state() {
    let h = harness().await;
    let name = h.submit(1, 0).await;
    h.start_building(&name).await;
    h.engine.complete(&name, ExecutionState::Success).await;
    h.sync().await;

    let pipeline = h.stores.pipelines.get("p-1", "demo").await.unwrap();
    assert_eq!(pipeline.status.last_run_state, Some(ExecutionState::Success));
}

#[tokio::test]
async fn test_engine_start_error_fails_provisioning() {
    let h = harness().await;
    h.engine.fail_run.store(true, Ordering::SeqCst);
    let name = h.submit(1, 0).await;
    h.reconcile(&name).await;
    h.sync().await;

    let exec = h.get(&name).await;
    assert_eq!(exec.state(), Some(ExecutionState::Failed));
    assert!(exec.status.conditions.is_false(ConditionType::Provisioned));
    assert!(exec
        .status
        .conditions
        .message(ConditionType::Provisioned)
        .contains("no runner available"));
    assert!(exec.is_finished());
    assert!(exec.status.ended.is_some());
    assert!(h.engine.started().await.is_empty());
    assert_eq!(h.controller.syncer().sync_once().await.unwrap(), 0);
}

#[tokio::test]
async fn test_engine_sync_error_fails_build() {
    let h = harness().await;
    let name = h.submit(1, 0).await;
    h.start_building(&name).await;

    h.engine.fail_sync.store(true, Ordering::SeqCst);
    h.sync().await;

    let exec = h.get(&name).await;
    assert_eq!(exec.state(), Some(ExecutionState::Failed));
    assert!(exec.status.conditions.is_false(ConditionType::Built));
    assert!(exec.is_finished());
    assert!(exec.status.ended.is_some());
    assert_eq!(h.active_count().await, 0);
}

#[tokio::test]
async fn test_engine_reported_failure_finishes_execution() {
    let h = harness().await;
    let name = h.submit(1, 0).await;
    h.start_building(&name).await;

    h.engine.complete(&name, ExecutionState::Failed).await;
    h.sync().await;

    let exec = h.get(&name).await;
    assert_eq!(exec.state(), Some(ExecutionState::Failed));
    assert!(!exec.status.conditions.any_failed());
    assert!(exec.is_finished());
    assert!(exec.status.ended.is_some());
    assert_eq!(h.controller.syncer().sync_once().await.unwrap(), 0);

    let pipeline = h.stores.pipelines.get("p-1", "demo").await.unwrap();
    assert_eq!(pipeline.status.last_run_state, Some(ExecutionState::Failed));
}

// =============================================
// Abort and finish path
// =============================================

#[tokio::test]
async fn test_abort_marks_building_work_and_cleans_up() {
    let h = harness().await;
    let name = h.submit(1, 0).await;
    h.start_building(&name).await;

    let pod = Pod {
        metadata: ObjectMeta::new("p-1-pipeline", "runner-abc")
            .with_label(LABEL_APP, RUNNER_NAME)
            .with_label(LABEL_EXECUTION, &name),
        ..Default::default()
    };
    h.stores.pods.create(pod).await.unwrap();

    let mut exec = h.get(&name).await;
    assert_eq!(exec.status.stages[0].state, Some(StepState::Building));
    exec.status.execution_state = Some(ExecutionState::Aborted);
    h.stores.executions.update(exec).await.unwrap();

    h.reconcile(&name).await;
    let exec = h.get(&name).await;
    assert_eq!(exec.state(), Some(ExecutionState::Aborted));
    assert_eq!(exec.status.stages[0].state, Some(StepState::Aborted));
    assert_eq!(exec.status.stages[0].steps[0].state, Some(StepState::Aborted));
    assert_eq!(exec.status.stages[1].state, Some(StepState::Waiting));
    assert_eq!(exec.status.conditions.message(ConditionType::Built), ABORTED_MESSAGE);
    assert!(exec.is_finished());
    assert!(exec.status.ended.is_some());

    assert!(h.engine.stopped().await.contains(&"p-1/demo-1".to_string()));
    assert!(h.stores.pods.get_optional("p-1-pipeline", "runner-abc").await.unwrap().is_none());

    let pipeline = h.stores.pipelines.get("p-1", "demo").await.unwrap();
    assert_eq!(pipeline.status.last_run_state, Some(ExecutionState::Aborted));
}

#[tokio::test]
async fn test_abort_before_initialization_skips_engine() {
    let h = harness().await;
    let name = h.submit(1, 0).await;
    let mut exec = h.get(&name).await;
    exec.status.execution_state = Some(ExecutionState::Aborted);
    h.stores.executions.update(exec).await.unwrap();

    h.reconcile(&name).await;
    let exec = h.get(&name).await;
    assert!(exec.is_finished());
    assert!(h.engine.stopped().await.is_empty());
}

async fn add_notifier(h: &Harness) {
    h.stores
        .notifiers
        .create(Notifier {
            metadata: ObjectMeta::new("c-1", "n-1"),
            display_name: "team".to_string(),
            kind: NotifierKind::Slack {
                url: "http://localhost/hook".to_string(),
                default_recipient: String::new(),
            },
        })
        .await
        .unwrap();
}

async fn submit_notifying(h: &Harness, run: u32) -> String {
    let name = h.submit(run, 0).await;
    let mut exec = h.get(&name).await;
    exec.spec.pipeline_config.notification = Some(PipelineNotification {
        recipients: vec![Recipient {
            recipient: "#builds".to_string(),
            notifier: "c-1:n-1".to_string(),
        }],
        message: String::new(),
        condition: vec!["Success".to_string()],
    });
    h.stores.executions.update(exec).await.unwrap();
    name
}

#[tokio::test]
async fn test_notification_sent_exactly_once() {
    let h = harness().await;
    add_notifier(&h).await;
    let name = submit_notifying(&h, 1).await;
    h.start_building(&name).await;
    h.engine.complete(&name, ExecutionState::Success).await;
    h.sync().await;

    h.reconcile(&name).await;
    assert_eq!(h.sender.count(), 1);
    assert!(h.get(&name).await.status.conditions.is_true(ConditionType::Notified));
    {
        let sent = h.sender.sent.lock().unwrap();
        assert_eq!(sent[0].0, "#builds");
        assert!(sent[0].1.content.contains("acme/widgets"));
    }

    h.reconcile(&name).await;
    h.reconcile(&name).await;
    assert_eq!(h.sender.count(), 1);
}

#[tokio::test]
async fn test_already_notified_execution_is_not_resent() {
    let h = harness().await;
    add_notifier(&h).await;
    let name = submit_notifying(&h, 1).await;
    let mut exec = h.get(&name).await;
    exec.status.execution_state = Some(ExecutionState::Success);
    exec.status.conditions.set_true(ConditionType::Notified);
    exec.mark_finished();
    h.stores.executions.update(exec).await.unwrap();

    h.reconcile(&name).await;
    assert_eq!(h.sender.count(), 0);
}

#[tokio::test]
async fn test_removed_active_execution_releases_queue() {
    let h = harness().await;
    h.set_quota("1").await;
    let a = h.submit(1, 0).await;
    h.start_building(&a).await;
    let b = h.submit(2, 10).await;
    h.reconcile(&b).await;
    assert_eq!(h.get(&b).await.state(), Some(ExecutionState::Queueing));

    let removed = h.get(&a).await;
    h.stores.executions.delete("p-1", &a).await.unwrap();
    h.controller.lifecycle().remove(&removed).await.unwrap();

    assert!(h.engine.stopped().await.contains(&"p-1/demo-1".to_string()));
    assert_eq!(h.get(&b).await.state(), Some(ExecutionState::Waiting));
}

// =============================================
// Controller loop
// =============================================

#[tokio::test]
async fn test_controller_drives_execution_to_success() {
    let h = harness().await;
    h.engine.auto_complete.store(true, Ordering::SeqCst);
    let cancel = CancellationToken::new();
    let handle = {
        let controller = h.controller.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { controller.run(cancel).await })
    };

    let name = h.submit(1, 0).await;
    let finished = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let exec = h.get(&name).await;
            if exec.is_finished() {
                return exec;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("execution did not finish");

    assert_eq!(finished.state(), Some(ExecutionState::Success));
    assert!(finished.status.conditions.is_true(ConditionType::Built));

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

// =============================================
// Shared helpers
// =============================================

#[tokio::test]
async fn test_concurrent_port_allocation_is_unique() {
    let stores = Stores::in_memory();
    let range: PortRange = "40000-40007".parse().unwrap();
    let allocator = Arc::new(PortAllocator::new(stores.config_maps.clone(), range));

    let tasks = (0..8).map(|i| {
        let allocator = allocator.clone();
        tokio::spawn(async move { allocator.ensure(&format!("p-{}", i)).await })
    });
    let ports: Vec<u16> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    let unique: HashSet<_> = ports.iter().collect();
    assert_eq!(unique.len(), 8);
    assert!(ports.iter().all(|p| range.contains(*p)));
}

#[test]
fn test_repo_name_parsing() {
    assert_eq!(repo_name_from_url("https://git.example.com/acme/widgets.git"), "acme/widgets");
    assert_eq!(repo_name_from_url("not-a-url"), "<not-a-url>");
}

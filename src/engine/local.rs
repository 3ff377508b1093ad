use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_common::pipeline::{ExecutionState, PipelineConfig, StepState};
use conveyor_common::{ConditionType, Object, PipelineExecution};
use futures::future::join_all;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::PipelineEngine;
use super::progress::{building_step, fail_step, finish_success, skip_step, success_step};
use crate::errors::EngineError;

/// How long `stop_execution` waits for killed steps to be reaped.
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Observed {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunOutcome {
    Succeeded,
    Failed,
    Aborted,
}

#[derive(Debug, Clone)]
struct StepProgress {
    observed: Observed,
    started: Option<DateTime<Utc>>,
    ended: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
struct RunProgress {
    steps: Vec<Vec<StepProgress>>,
    outcome: Option<RunOutcome>,
}

struct RunHandle {
    cancel: CancellationToken,
    done: CancellationToken,
    progress: Mutex<RunProgress>,
}

impl RunHandle {
    async fn set_step(&self, stage: usize, step: usize, observed: Observed) {
        let mut progress = self.progress.lock().await;
        let entry = &mut progress.steps[stage][step];
        let now = Utc::now();
        match observed {
            Observed::Running => {
                entry.started = Some(now);
            }
            Observed::Pending => {}
            _ => {
                entry.started.get_or_insert(now);
                entry.ended = Some(now);
            }
        }
        entry.observed = observed;
    }
}

/// Runs `run_script` steps as `sh -c` child processes.
///
/// Stages run in order; steps of one stage run concurrently. A failing step
/// aborts its running siblings and stops the pipeline. Step output is written
/// to `<workspace>/<namespace>/<execution>/logs/<stage>-<step>.log`, so logs
/// remain readable from other processes and after a restart.
pub struct LocalEngine {
    workspace_root: PathBuf,
    runs: Arc<Mutex<HashMap<String, Arc<RunHandle>>>>,
}

impl LocalEngine {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn execution_dir(&self, execution: &PipelineExecution) -> PathBuf {
        self.workspace_root
            .join(execution.namespace())
            .join(execution.name())
    }

    fn log_path(&self, execution: &PipelineExecution, stage: usize, step: usize) -> PathBuf {
        self.execution_dir(execution)
            .join("logs")
            .join(format!("{}-{}.log", stage, step))
    }

    async fn start(&self, execution: &PipelineExecution) -> Result<(), EngineError> {
        let key = execution.key();
        let config = execution.spec.pipeline_config.clone();
        let exec_dir = self.execution_dir(execution);
        let source_dir = exec_dir.join("src");
        let logs_dir = exec_dir.join("logs");
        tokio::fs::create_dir_all(&source_dir).await?;
        tokio::fs::create_dir_all(&logs_dir).await?;

        let handle = Arc::new(RunHandle {
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
            progress: Mutex::new(RunProgress {
                steps: config
                    .stages
                    .iter()
                    .map(|stage| {
                        stage
                            .steps
                            .iter()
                            .map(|_| StepProgress {
                                observed: Observed::Pending,
                                started: None,
                                ended: None,
                            })
                            .collect()
                    })
                    .collect(),
                outcome: None,
            }),
        });
        self.runs.lock().await.insert(key.clone(), Arc::clone(&handle));

        info!(execution = %key, stages = config.stages.len(), "Starting local pipeline run");
        tokio::spawn(async move {
            let outcome = drive(&handle, &config, &source_dir, &logs_dir).await;
            info!(execution = %key, outcome = ?outcome, "Local pipeline run finished");
            handle.progress.lock().await.outcome = Some(outcome);
            handle.done.cancel();
        });
        Ok(())
    }
}

async fn drive(
    handle: &Arc<RunHandle>,
    config: &PipelineConfig,
    source_dir: &Path,
    logs_dir: &Path,
) -> RunOutcome {
    let timeout = (config.timeout > 0).then(|| Duration::from_secs(u64::from(config.timeout) * 60));

    for (stage_idx, stage) in config.stages.iter().enumerate() {
        if handle.cancel.is_cancelled() {
            return RunOutcome::Aborted;
        }
        let stage_cancel = handle.cancel.child_token();
        let steps = stage.steps.iter().enumerate().map(|(step_idx, step)| {
            let stage_cancel = stage_cancel.clone();
            async move {
                let script = step
                    .run_script_config
                    .as_ref()
                    .map(|c| c.shell_script.trim())
                    .filter(|s| !s.is_empty());
                let Some(script) = script else {
                    handle.set_step(stage_idx, step_idx, Observed::Skipped).await;
                    return Observed::Skipped;
                };
                let log_path = logs_dir.join(format!("{}-{}.log", stage_idx, step_idx));
                handle.set_step(stage_idx, step_idx, Observed::Running).await;
                let observed = run_step(script, &step.env, source_dir, &log_path, &stage_cancel, timeout).await;
                if observed == Observed::Failed {
                    stage_cancel.cancel();
                }
                handle.set_step(stage_idx, step_idx, observed).await;
                observed
            }
        });
        let results = join_all(steps).await;

        if results.contains(&Observed::Failed) {
            return RunOutcome::Failed;
        }
        if handle.cancel.is_cancelled() || results.contains(&Observed::Aborted) {
            return RunOutcome::Aborted;
        }
    }
    RunOutcome::Succeeded
}

async fn run_step(
    script: &str,
    env: &std::collections::BTreeMap<String, String>,
    source_dir: &Path,
    log_path: &Path,
    cancel: &CancellationToken,
    timeout: Option<Duration>,
) -> Observed {
    let spawned = std::fs::File::create(log_path).and_then(|log| {
        let stderr = log.try_clone()?;
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .current_dir(source_dir)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
    });
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            warn!(log = %log_path.display(), error = %e, "Failed to spawn step");
            append_log(log_path, &format!("failed to start step: {}\n", e)).await;
            return Observed::Failed;
        }
    };

    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        status = child.wait() => match status {
            Ok(status) if status.success() => Observed::Succeeded,
            Ok(status) => {
                debug!(log = %log_path.display(), code = ?status.code(), "Step exited non-zero");
                Observed::Failed
            }
            Err(e) => {
                append_log(log_path, &format!("failed to wait for step: {}\n", e)).await;
                Observed::Failed
            }
        },
        _ = cancel.cancelled() => {
            if let Err(e) = child.kill().await {
                warn!(log = %log_path.display(), error = %e, "Failed to kill step");
            }
            Observed::Aborted
        }
        _ = deadline => {
            if let Err(e) = child.kill().await {
                warn!(log = %log_path.display(), error = %e, "Failed to kill timed out step");
            }
            append_log(log_path, "step timed out\n").await;
            Observed::Failed
        }
    }
}

async fn append_log(path: &Path, line: &str) {
    use tokio::io::AsyncWriteExt;
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await;
    if let Ok(mut file) = file {
        let _ = file.write_all(line.as_bytes()).await;
    }
}

#[async_trait]
impl PipelineEngine for LocalEngine {
    async fn pre_check(&self, _execution: &PipelineExecution) -> Result<bool, EngineError> {
        tokio::fs::create_dir_all(&self.workspace_root).await?;
        Ok(true)
    }

    async fn run_pipeline_execution(&self, execution: &PipelineExecution) -> Result<(), EngineError> {
        if self.runs.lock().await.contains_key(&execution.key()) {
            return Ok(());
        }
        self.start(execution).await
    }

    async fn rerun_execution(&self, execution: &PipelineExecution) -> Result<(), EngineError> {
        match self.stop_execution(execution).await {
            Ok(()) | Err(EngineError::NotRunning(_)) => {}
            Err(e) => return Err(e),
        }
        self.runs.lock().await.remove(&execution.key());
        let logs_dir = self.execution_dir(execution).join("logs");
        if logs_dir.exists() {
            tokio::fs::remove_dir_all(&logs_dir).await?;
        }
        self.start(execution).await
    }

    async fn stop_execution(&self, execution: &PipelineExecution) -> Result<(), EngineError> {
        let key = execution.key();
        let handle = self.runs.lock().await.get(&key).cloned();
        let Some(handle) = handle else {
            return Err(EngineError::NotRunning(key));
        };
        if handle.done.is_cancelled() {
            return Err(EngineError::NotRunning(key));
        }

        info!(execution = %key, "Stopping local pipeline run");
        handle.cancel.cancel();
        if tokio::time::timeout(STOP_GRACE, handle.done.cancelled())
            .await
            .is_err()
        {
            warn!(execution = %key, "Run did not settle within the stop grace period");
        }
        Ok(())
    }

    async fn get_step_log(
        &self,
        execution: &PipelineExecution,
        stage: usize,
        step: usize,
    ) -> Result<String, EngineError> {
        let exists = execution
            .spec
            .pipeline_config
            .stages
            .get(stage)
            .is_some_and(|s| step < s.steps.len());
        if !exists {
            return Err(EngineError::InvalidStep {
                execution: execution.key(),
                stage,
                step,
            });
        }

        let path = self.log_path(execution, stage, step);
        match tokio::fs::read_to_string(&path).await {
            Ok(log) => Ok(log),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(EngineError::NotFound(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn sync_execution(&self, execution: &mut PipelineExecution) -> Result<bool, EngineError> {
        let handle = self.runs.lock().await.get(&execution.key()).cloned();
        let Some(handle) = handle else {
            return Ok(false);
        };
        let progress = handle.progress.lock().await.clone();
        execution.seed_stage_status();
        Ok(apply_progress(execution, &progress))
    }
}

/// Fold a progress snapshot into the execution status.
fn apply_progress(execution: &mut PipelineExecution, progress: &RunProgress) -> bool {
    let mut updated = false;
    let now = Utc::now();

    for (stage, steps) in progress.steps.iter().enumerate() {
        for (step, observed) in steps.iter().enumerate() {
            let Some(current) = execution
                .status
                .stages
                .get(stage)
                .and_then(|s| s.steps.get(step))
                .map(|s| s.state)
            else {
                continue;
            };
            let started = observed.started.unwrap_or(now);
            let ended = observed.ended.unwrap_or(now);
            match observed.observed {
                Observed::Succeeded if current != Some(StepState::Success) => {
                    success_step(execution, stage, step, started, ended);
                    updated = true;
                }
                Observed::Failed if current != Some(StepState::Failed) => {
                    fail_step(execution, stage, step, started, ended);
                    updated = true;
                }
                Observed::Aborted
                    if !matches!(current, Some(StepState::Failed | StepState::Aborted)) =>
                {
                    fail_step(execution, stage, step, started, ended);
                    updated = true;
                }
                Observed::Running
                    if matches!(current, None | Some(StepState::Waiting)) =>
                {
                    building_step(execution, stage, step, started);
                    updated = true;
                }
                Observed::Skipped if current != Some(StepState::Skipped) => {
                    skip_step(execution, stage, step, ended);
                    updated = true;
                }
                _ => {}
            }
        }
    }

    let state = execution.state();
    match progress.outcome {
        Some(RunOutcome::Succeeded) if state != Some(ExecutionState::Success) => {
            finish_success(execution, now);
            updated = true;
        }
        Some(RunOutcome::Failed)
            if !matches!(state, Some(ExecutionState::Failed | ExecutionState::Aborted)) =>
        {
            execution.status.execution_state = Some(ExecutionState::Failed);
            execution.status.ended.get_or_insert(now);
            execution.mark_finished();
            let conditions = &mut execution.status.conditions;
            if conditions.is_unknown(ConditionType::Provisioned) {
                conditions.set_true(ConditionType::Provisioned);
            }
            conditions.set_false(ConditionType::Built);
            conditions.set_message(ConditionType::Built, "pipeline run failed");
            updated = true;
        }
        None if state == Some(ExecutionState::Waiting) && progress_started(progress) => {
            execution.status.execution_state = Some(ExecutionState::Building);
            updated = true;
        }
        _ => {}
    }

    if execution.state() == Some(ExecutionState::Building)
        && !execution.status.conditions.is_true(ConditionType::Provisioned)
    {
        execution.status.conditions.set_true(ConditionType::Provisioned);
        updated = true;
    }

    updated
}

fn progress_started(progress: &RunProgress) -> bool {
    progress
        .steps
        .iter()
        .flatten()
        .any(|s| s.observed != Observed::Pending)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_common::pipeline::{PipelineExecutionSpec, RunScriptConfig, Stage, Step};
    use conveyor_common::ObjectMeta;

    fn script(cmd: &str) -> Step {
        Step {
            run_script_config: Some(RunScriptConfig {
                image: "alpine".to_string(),
                shell_script: cmd.to_string(),
            }),
            ..Default::default()
        }
    }

    fn execution(stages: Vec<Stage>) -> PipelineExecution {
        let mut exec = PipelineExecution {
            metadata: ObjectMeta::new("p-1", "demo-1"),
            spec: PipelineExecutionSpec {
                project_name: "c-1:p-1".to_string(),
                pipeline_name: "p-1:demo".to_string(),
                run: 1,
                pipeline_config: PipelineConfig {
                    stages,
                    ..Default::default()
                },
                ..Default::default()
            },
            status: Default::default(),
        };
        exec.status.execution_state = Some(ExecutionState::Waiting);
        exec.status.conditions.set_true(ConditionType::Initialized);
        exec.status.conditions.set_unknown(ConditionType::Provisioned);
        exec.seed_stage_status();
        exec
    }

    async fn sync_until_terminal(engine: &LocalEngine, exec: &mut PipelineExecution) {
        for _ in 0..200 {
            engine.sync_execution(exec).await.unwrap();
            if exec.is_terminal() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("execution did not reach a terminal state");
    }

    #[tokio::test]
    async fn test_successful_run_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let engine = LocalEngine::new(dir.path());
        let mut exec = execution(vec![
            Stage {
                name: "build".to_string(),
                steps: vec![script("echo building")],
            },
            Stage {
                name: "publish".to_string(),
                steps: vec![Step::default()],
            },
        ]);

        assert!(engine.pre_check(&exec).await.unwrap());
        engine.run_pipeline_execution(&exec).await.unwrap();
        sync_until_terminal(&engine, &mut exec).await;

        assert_eq!(exec.state(), Some(ExecutionState::Success));
        assert!(exec.is_finished());
        assert_eq!(exec.status.stages[0].steps[0].state, Some(StepState::Success));
        assert!(exec.status.stages[0].steps[0].ended.is_some());
        assert_eq!(exec.status.stages[1].state, Some(StepState::Skipped));

        let log = engine.get_step_log(&exec, 0, 0).await.unwrap();
        assert!(log.contains("building"));
    }

    #[tokio::test]
    async fn test_failing_step_fails_execution() {
        let dir = tempfile::tempdir().unwrap();
        let engine = LocalEngine::new(dir.path());
        let mut exec = execution(vec![
            Stage {
                name: "test".to_string(),
                steps: vec![script("exit 3")],
            },
            Stage {
                name: "deploy".to_string(),
                steps: vec![script("echo never")],
            },
        ]);

        engine.run_pipeline_execution(&exec).await.unwrap();
        sync_until_terminal(&engine, &mut exec).await;

        assert_eq!(exec.state(), Some(ExecutionState::Failed));
        assert!(exec.status.conditions.is_false(ConditionType::Built));
        assert_eq!(
            exec.status.conditions.message(ConditionType::Built),
            "Got FAILED status in 'test' stage"
        );
        assert_eq!(exec.status.stages[1].steps[0].state, None);
    }

    #[tokio::test]
    async fn test_stop_kills_running_step() {
        let dir = tempfile::tempdir().unwrap();
        let engine = LocalEngine::new(dir.path());
        let exec = execution(vec![Stage {
            name: "long".to_string(),
            steps: vec![script("sleep 30")],
        }]);

        engine.run_pipeline_execution(&exec).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.stop_execution(&exec).await.unwrap();

        let err = engine.stop_execution(&exec).await.unwrap_err();
        assert!(matches!(err, EngineError::NotRunning(_)));
    }

    #[tokio::test]
    async fn test_stop_unknown_execution_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let engine = LocalEngine::new(dir.path());
        let exec = execution(vec![]);
        assert!(matches!(
            engine.stop_execution(&exec).await,
            Err(EngineError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_step_log_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let engine = LocalEngine::new(dir.path());
        let exec = execution(vec![Stage {
            name: "build".to_string(),
            steps: vec![script("true")],
        }]);
        assert!(matches!(
            engine.get_step_log(&exec, 0, 5).await,
            Err(EngineError::InvalidStep { .. })
        ));
        assert!(matches!(
            engine.get_step_log(&exec, 0, 0).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sync_without_run_reports_no_change() {
        let dir = tempfile::tempdir().unwrap();
        let engine = LocalEngine::new(dir.path());
        let mut exec = execution(vec![]);
        assert!(!engine.sync_execution(&mut exec).await.unwrap());
    }
}

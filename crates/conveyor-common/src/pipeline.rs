//! Pipeline and pipeline execution objects.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::condition::Conditions;
use crate::impl_object;
use crate::meta::{ObjectMeta, ProjectRef};
use crate::CommonError;

/// Label marking whether an execution reached a terminal state.
///
/// `"true"` terminal, `"false"` admitted and active, `""` queued. Listings of
/// active work select on this label, so it must track `ExecutionState`.
pub const FINISH_LABEL: &str = "pipeline.conveyor.dev/finish";

/// Annotation carrying the local registry port assigned to the project.
pub const LOCAL_REGISTRY_PORT_ANNOTATION: &str = "pipeline.conveyor.dev/registry-port";

/// Notification trigger that fires when the state differs from the previous run.
pub const CONDITION_CHANGED: &str = "Changed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionState {
    Queueing,
    Waiting,
    Building,
    Success,
    Failed,
    Aborted,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queueing => "Queueing",
            Self::Waiting => "Waiting",
            Self::Building => "Building",
            Self::Success => "Success",
            Self::Failed => "Failed",
            Self::Aborted => "Aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Aborted)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionState {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Queueing" => Ok(Self::Queueing),
            "Waiting" => Ok(Self::Waiting),
            "Building" => Ok(Self::Building),
            "Success" => Ok(Self::Success),
            "Failed" => Ok(Self::Failed),
            "Aborted" => Ok(Self::Aborted),
            other => Err(CommonError::InvalidState(other.to_string())),
        }
    }
}

/// State of a single stage or step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepState {
    Waiting,
    Building,
    Success,
    Failed,
    Skipped,
    Aborted,
}

impl StepState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Building => "Building",
            Self::Success => "Success",
            Self::Failed => "Failed",
            Self::Skipped => "Skipped",
            Self::Aborted => "Aborted",
        }
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Pipeline configuration snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    #[serde(default)]
    pub stages: Vec<Stage>,
    /// Per-step timeout in minutes, enforced by the engine. Zero means none.
    #[serde(default)]
    pub timeout: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification: Option<PipelineNotification>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_script_config: Option<RunScriptConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_image_config: Option<PublishImageConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_yaml_config: Option<ApplyYamlConfig>,
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub env: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunScriptConfig {
    pub image: String,
    #[serde(default)]
    pub shell_script: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishImageConfig {
    #[serde(default)]
    pub dockerfile_path: String,
    #[serde(default)]
    pub build_context: String,
    pub tag: String,
    #[serde(default)]
    pub push_remote: bool,
    #[serde(default)]
    pub registry: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyYamlConfig {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub namespace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineNotification {
    #[serde(default)]
    pub recipients: Vec<Recipient>,
    /// Overrides the generated summary when non-empty.
    #[serde(default)]
    pub message: String,
    /// Execution states (or [`CONDITION_CHANGED`]) that trigger delivery.
    #[serde(default)]
    pub condition: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub recipient: String,
    /// `"<cluster>:<notifier>"` or a bare notifier name.
    pub notifier: String,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSpec {
    pub project_name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub repository_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    /// Run number the next submitted execution should carry. Never decremented.
    pub next_run: u32,
    #[serde(default)]
    pub last_execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_state: Option<ExecutionState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_started: Option<DateTime<Utc>>,
}

impl Default for PipelineStatus {
    fn default() -> Self {
        Self {
            next_run: 1,
            last_execution_id: String::new(),
            last_run_state: None,
            last_started: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub metadata: ObjectMeta,
    pub spec: PipelineSpec,
    #[serde(default)]
    pub status: PipelineStatus,
}

impl_object!(Pipeline, "Pipeline");

/// Who submitted a run and from which commit.
#[derive(Debug, Clone, Default)]
pub struct Provenance {
    pub trigger_user_name: String,
    pub branch: String,
    pub commit: String,
    pub message: String,
    pub author: String,
}

impl Pipeline {
    /// Build the execution for this pipeline's next run from a frozen config.
    ///
    /// The run number is only claimed once the controller has seen the
    /// created execution, so two calls before then collide on the name.
    pub fn new_execution(
        &self,
        pipeline_config: PipelineConfig,
        provenance: Provenance,
    ) -> PipelineExecution {
        let run = self.status.next_run;
        PipelineExecution {
            metadata: ObjectMeta::new(
                &self.metadata.namespace,
                execution_name(&self.metadata.name, run),
            ),
            spec: PipelineExecutionSpec {
                project_name: self.spec.project_name.clone(),
                pipeline_name: self.metadata.reference(),
                pipeline_config,
                repository_url: self.spec.repository_url.clone(),
                run,
                triggered_by: TriggeredBy::User,
                trigger_user_name: provenance.trigger_user_name,
                commit: provenance.commit,
                event: "manual".to_string(),
                branch: provenance.branch,
                message: provenance.message,
                author: provenance.author,
                ..Default::default()
            },
            status: Default::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineExecution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggeredBy {
    #[default]
    User,
    Cron,
    Webhook,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineExecutionSpec {
    /// `"<cluster>:<project>"`.
    pub project_name: String,
    /// `"<namespace>:<pipeline>"`.
    pub pipeline_name: String,
    pub pipeline_config: PipelineConfig,
    #[serde(default)]
    pub repository_url: String,
    pub run: u32,
    #[serde(default)]
    pub triggered_by: TriggeredBy,
    #[serde(default)]
    pub trigger_user_name: String,
    #[serde(default)]
    pub commit: String,
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default, rename = "ref")]
    pub git_ref: String,
    #[serde(default)]
    pub html_link: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub avatar_url: String,
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StepState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    /// Set when the step completes; log streamers stop polling once present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StepState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended: Option<DateTime<Utc>>,
    #[serde(default)]
    pub steps: Vec<StepStatus>,
}

impl StageStatus {
    /// Every step finished successfully or was skipped.
    pub fn is_success(&self) -> bool {
        self.steps
            .iter()
            .all(|s| matches!(s.state, Some(StepState::Success | StepState::Skipped)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineExecutionStatus {
    #[serde(default)]
    pub conditions: Conditions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_state: Option<ExecutionState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stages: Vec<StageStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineExecution {
    pub metadata: ObjectMeta,
    pub spec: PipelineExecutionSpec,
    #[serde(default)]
    pub status: PipelineExecutionStatus,
}

impl_object!(PipelineExecution, "PipelineExecution");

/// Decoded value of [`FINISH_LABEL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishMark {
    /// Waiting for quota (`""`).
    Queued,
    /// Admitted and not yet terminal (`"false"`).
    Active,
    /// Terminal (`"true"`).
    Finished,
}

impl FinishMark {
    pub fn label_value(&self) -> &'static str {
        match self {
            Self::Queued => "",
            Self::Active => "false",
            Self::Finished => "true",
        }
    }
}

/// Conventional execution name: `"<pipeline>-<run>"`.
pub fn execution_name(pipeline: &str, run: u32) -> String {
    format!("{}-{}", pipeline, run)
}

impl PipelineExecution {
    pub fn project(&self) -> Result<ProjectRef, CommonError> {
        self.spec.project_name.parse()
    }

    pub fn state(&self) -> Option<ExecutionState> {
        self.status.execution_state
    }

    pub fn is_terminal(&self) -> bool {
        self.status
            .execution_state
            .is_some_and(|s| s.is_terminal())
    }

    pub fn finish_mark(&self) -> Option<FinishMark> {
        match self.metadata.label(FINISH_LABEL)? {
            "true" => Some(FinishMark::Finished),
            "false" => Some(FinishMark::Active),
            _ => Some(FinishMark::Queued),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finish_mark() == Some(FinishMark::Finished)
    }

    pub fn set_finish_mark(&mut self, mark: FinishMark) {
        self.metadata
            .labels
            .insert(FINISH_LABEL.to_string(), mark.label_value().to_string());
    }

    /// Mark terminal: finish label `true` and `Ended` stamped once.
    pub fn mark_finished(&mut self) {
        self.set_finish_mark(FinishMark::Finished);
        if self.status.ended.is_none() {
            self.status.ended = Some(Utc::now());
        }
    }

    /// Seed one `Waiting` status entry per configured stage and step.
    pub fn seed_stage_status(&mut self) {
        if !self.status.stages.is_empty() {
            return;
        }
        self.status.stages = self
            .spec
            .pipeline_config
            .stages
            .iter()
            .map(|stage| StageStatus {
                state: Some(StepState::Waiting),
                steps: stage
                    .steps
                    .iter()
                    .map(|_| StepStatus {
                        state: Some(StepState::Waiting),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            })
            .collect();
    }

    /// `"<namespace>:<name>"`, the form stored in `Pipeline.status.last_execution_id`.
    pub fn reference(&self) -> String {
        self.metadata.reference()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::Object;

    #[test]
    fn test_new_execution_uses_next_run() {
        let mut pipeline = Pipeline {
            metadata: ObjectMeta::new("p-1", "demo"),
            spec: PipelineSpec {
                project_name: "c-1:p-1".to_string(),
                display_name: "demo".to_string(),
                repository_url: "https://github.com/acme/widgets.git".to_string(),
            },
            status: Default::default(),
        };
        pipeline.status.next_run = 4;
        let provenance = Provenance {
            trigger_user_name: "alice".to_string(),
            branch: "main".to_string(),
            ..Default::default()
        };

        let exec = pipeline.new_execution(PipelineConfig::default(), provenance);
        assert_eq!(exec.metadata.name, "demo-4");
        assert_eq!(exec.metadata.namespace, "p-1");
        assert_eq!(exec.spec.pipeline_name, "p-1:demo");
        assert_eq!(exec.spec.run, 4);
        assert_eq!(exec.spec.project_name, "c-1:p-1");
        assert_eq!(exec.spec.trigger_user_name, "alice");
        assert_eq!(exec.spec.branch, "main");
        assert_eq!(exec.spec.event, "manual");
        assert!(exec.status.execution_state.is_none());
    }

    fn execution() -> PipelineExecution {
        PipelineExecution {
            metadata: ObjectMeta::new("p-1", "demo-1"),
            spec: PipelineExecutionSpec {
                project_name: "c-1:p-1".to_string(),
                pipeline_name: "p-1:demo".to_string(),
                run: 1,
                pipeline_config: PipelineConfig {
                    stages: vec![
                        Stage {
                            name: "build".to_string(),
                            steps: vec![Step::default(), Step::default()],
                        },
                        Stage {
                            name: "test".to_string(),
                            steps: vec![Step::default()],
                        },
                    ],
                    ..Default::default()
                },
                ..Default::default()
            },
            status: Default::default(),
        }
    }

    #[test]
    fn test_finish_mark_round_trip() {
        let mut exec = execution();
        assert_eq!(exec.finish_mark(), None);
        for mark in [FinishMark::Queued, FinishMark::Active, FinishMark::Finished] {
            exec.set_finish_mark(mark);
            assert_eq!(exec.finish_mark(), Some(mark));
        }
    }

    #[test]
    fn test_mark_finished_stamps_ended_once() {
        let mut exec = execution();
        exec.mark_finished();
        let ended = exec.status.ended;
        assert!(ended.is_some());
        exec.mark_finished();
        assert_eq!(exec.status.ended, ended);
        assert!(exec.is_finished());
    }

    #[test]
    fn test_seed_stage_status_matches_config() {
        let mut exec = execution();
        exec.seed_stage_status();
        assert_eq!(exec.status.stages.len(), 2);
        assert_eq!(exec.status.stages[0].steps.len(), 2);
        assert_eq!(exec.status.stages[1].state, Some(StepState::Waiting));
    }

    #[test]
    fn test_terminal_states() {
        assert!(ExecutionState::Success.is_terminal());
        assert!(ExecutionState::Failed.is_terminal());
        assert!(ExecutionState::Aborted.is_terminal());
        assert!(!ExecutionState::Queueing.is_terminal());
        assert!(!ExecutionState::Building.is_terminal());
    }

    #[test]
    fn test_execution_state_from_str() {
        assert_eq!("Failed".parse::<ExecutionState>().unwrap(), ExecutionState::Failed);
        assert!("failed".parse::<ExecutionState>().is_err());
    }

    #[test]
    fn test_stage_success_counts_skipped() {
        let stage = StageStatus {
            steps: vec![
                StepStatus {
                    state: Some(StepState::Success),
                    ..Default::default()
                },
                StepStatus {
                    state: Some(StepState::Skipped),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert!(stage.is_success());
    }

    #[test]
    fn test_pipeline_config_from_yaml() {
        let yaml = r##"
stages:
  - name: build
    steps:
      - runScriptConfig:
          image: alpine
          shellScript: echo hi
timeout: 30
notification:
  recipients:
    - recipient: "#builds"
      notifier: c-1:slack
  condition: [Failed, Changed]
"##;
        let config: PipelineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.stages[0].name, "build");
        assert_eq!(config.timeout, 30);
        let notification = config.notification.unwrap();
        assert_eq!(notification.recipients[0].notifier, "c-1:slack");
        assert_eq!(notification.condition, vec!["Failed", "Changed"]);
    }

    #[test]
    fn test_execution_key_and_reference() {
        let exec = execution();
        assert_eq!(exec.key(), "p-1/demo-1");
        assert_eq!(exec.reference(), "p-1:demo-1");
        assert_eq!(execution_name("demo", 4), "demo-4");
    }
}

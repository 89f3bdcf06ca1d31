//! 计划步骤与步骤状态机
//!
//! 合法迁移只有四条：Pending→InProgress、InProgress→Completed、InProgress→Failed、Pending→Skipped。
//! 不允许回到 Pending，每个步骤至多执行一次。

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::error::EngineError;

pub type StepId = String;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress) | (InProgress, Completed) | (InProgress, Failed) | (Pending, Skipped)
        )
    }

    /// 尚未走完生命周期（Pending / InProgress）
    pub fn is_open(self) -> bool {
        matches!(self, StepStatus::Pending | StepStatus::InProgress)
    }
}

/// 规划器 / 工具给出的步骤描述（模型输出经 schema 校验后得到）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StepSpec {
    /// 计划内唯一的步骤 id
    pub id: String,
    pub description: String,
    /// search_internal / search_external / write_file / analyze_code / finish
    pub action_type: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// 必须先 Completed 的步骤 id，只能引用更早出现的步骤
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
}

impl StepSpec {
    pub fn new(id: impl Into<String>, action_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            description: id.clone(),
            id,
            action_type: action_type.into(),
            parameters: Map::new(),
            dependencies: Vec::new(),
            reasoning: String::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: StepId,
    pub description: String,
    pub action_type: String,
    pub parameters: Map<String, Value>,
    pub dependencies: Vec<StepId>,
    pub status: StepStatus,
    pub reasoning: String,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<StepSpec> for PlanStep {
    fn from(spec: StepSpec) -> Self {
        Self {
            id: spec.id,
            description: spec.description,
            action_type: spec.action_type,
            parameters: spec.parameters,
            dependencies: spec.dependencies,
            status: StepStatus::Pending,
            reasoning: spec.reasoning,
            error_message: None,
            started_at: None,
            completed_at: None,
        }
    }
}

impl PlanStep {
    /// 按状态机迁移，并记录开始 / 结束时间
    pub fn transition(&mut self, next: StepStatus) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                step_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        match next {
            StepStatus::InProgress => self.started_at = Some(now),
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped => {
                self.completed_at = Some(now)
            }
            StepStatus::Pending => {}
        }
        self.status = next;
        Ok(())
    }

    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut step = PlanStep::from(StepSpec::new("s1", "search_internal"));
        assert_eq!(step.status, StepStatus::Pending);
        step.transition(StepStatus::InProgress).unwrap();
        assert!(step.started_at.is_some());
        step.transition(StepStatus::Completed).unwrap();
        assert!(step.completed_at.is_some());
    }

    #[test]
    fn test_no_reentry_into_pending() {
        let mut step = PlanStep::from(StepSpec::new("s1", "write_file"));
        step.transition(StepStatus::InProgress).unwrap();
        step.transition(StepStatus::Failed).unwrap();

        let err = step.transition(StepStatus::Pending).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert!(step.transition(StepStatus::InProgress).is_err());
        assert_eq!(step.status, StepStatus::Failed);
    }

    #[test]
    fn test_skip_only_from_pending() {
        let mut step = PlanStep::from(StepSpec::new("s1", "finish"));
        step.transition(StepStatus::InProgress).unwrap();
        assert!(step.transition(StepStatus::Skipped).is_err());

        let mut other = PlanStep::from(StepSpec::new("s2", "finish"));
        other.transition(StepStatus::Skipped).unwrap();
        assert!(!other.status.is_open());
        assert!(!StepStatus::Failed.is_open());
    }

    #[test]
    fn test_spec_defaults_when_deserializing() {
        let spec: StepSpec = serde_json::from_str(
            r#"{"id": "a", "description": "look around", "action_type": "search_internal"}"#,
        )
        .unwrap();
        assert!(spec.parameters.is_empty());
        assert!(spec.dependencies.is_empty());
        assert_eq!(spec.reasoning, "");
    }
}

//! 引擎错误类型
//!
//! 与 RecoveryEngine 配合：分诊失败回退到最强路线、计划失败至多重问一次、其余错误终止任务。

use thiserror::Error;

use crate::core::state::TaskId;
use crate::core::step::StepStatus;
use crate::llm::LlmError;

/// 任务编排过程中可能出现的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("classification failed: {0}")]
    ClassificationFailure(String),

    /// 模型输出不符合预期结构
    #[error("parse failure: {0}")]
    ParseFailure(String),

    #[error("planner failed to produce a valid plan: {0}")]
    PlanGenerationFailure(String),

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("step {step_id} failed: {reason}")]
    StepExecutionFailure { step_id: String, reason: String },

    #[error("tool {tool} failed: {reason}")]
    ToolFailed { tool: String, reason: String },

    #[error("tool timeout: {0}")]
    ToolTimeout(String),

    #[error("unknown action type: {0}")]
    UnknownAction(String),

    #[error(
        "scheduler deadlock: pending steps [{}] can never run, unresolved dependencies [{}]",
        .blocked.join(", "),
        .unresolved.join(", ")
    )]
    SchedulerDeadlock {
        blocked: Vec<String>,
        unresolved: Vec<String>,
    },

    #[error("loop ceiling exceeded: {loops} iterations (max {max})")]
    LoopCeilingExceeded { loops: u32, max: u32 },

    #[error("step {step_id}: invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        step_id: String,
        from: StepStatus,
        to: StepStatus,
    },

    /// 任务已进入终态，拒绝一切修改
    #[error("task {0} is already terminal")]
    TaskTerminated(TaskId),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task registry is full ({0} live tasks)")]
    RegistryFull(usize),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

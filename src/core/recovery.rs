//! 错误恢复引擎
//!
//! 根据 (EngineError, 出错位置) 返回 RecoveryAction：计划结构错误在预算内重问一次，
//! 非关键步骤失败继续执行，其余一律终止任务。分诊失败在分诊阶段内部回退，不经过这里。

use crate::core::error::EngineError;

/// 错误发生的位置
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureSite<'a> {
    /// attempt 从 1 计
    Planning { attempt: u32, max_attempts: u32 },
    Step { action_type: &'a str },
}

/// 恢复引擎给出的建议动作
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 以相同输入再请求一次计划
    Reask,
    /// 吸收失败，继续调度其余步骤
    Continue,
    /// 终止任务，附带失败原因
    Abort(String),
}

#[derive(Clone, Debug, Default)]
pub struct RecoveryEngine {
    /// 失败不致命的动作类型（显式选择加入）
    non_critical_actions: Vec<String>,
}

impl RecoveryEngine {
    pub fn new(non_critical_actions: Vec<String>) -> Self {
        Self {
            non_critical_actions,
        }
    }

    pub fn is_critical(&self, action_type: &str) -> bool {
        !self.non_critical_actions.iter().any(|a| a == action_type)
    }

    pub fn handle(&self, err: &EngineError, site: FailureSite<'_>) -> RecoveryAction {
        match site {
            FailureSite::Planning {
                attempt,
                max_attempts,
            } => match err {
                EngineError::ParseFailure(_) | EngineError::InvalidPlan(_)
                    if attempt < max_attempts =>
                {
                    RecoveryAction::Reask
                }
                EngineError::PlanGenerationFailure(_) => RecoveryAction::Abort(err.to_string()),
                other => RecoveryAction::Abort(
                    EngineError::PlanGenerationFailure(other.to_string()).to_string(),
                ),
            },
            FailureSite::Step { action_type } => match err {
                EngineError::UnknownAction(_) | EngineError::Cancelled(_) => {
                    RecoveryAction::Abort(err.to_string())
                }
                _ if self.is_critical(action_type) => RecoveryAction::Abort(err.to_string()),
                _ => RecoveryAction::Continue,
            },
        }
    }
}

//! 步骤调度：按插入顺序（FIFO）选出下一个可运行步骤
//!
//! 可运行 = 状态为 Pending 且所有依赖都存在并已 Completed。finish 步骤另有一条隐式依赖：
//! 其余非 finish 步骤全部落定（Completed / Failed / Skipped）之后才可运行，
//! 因此执行中追加到计划末尾的后续步骤会先于 finish 执行。调度是纯函数，反复调用无副作用。
//! 选不出步骤时区分两种情况：计划耗尽（无 Pending）与死锁（仍有 Pending 但都不可运行）。

use std::collections::{HashMap, HashSet};

use crate::core::step::{PlanStep, StepStatus};

/// 调度结论
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Schedule {
    /// plan_steps 中可运行步骤的下标
    Runnable(usize),
    /// 没有 Pending 步骤
    Exhausted,
    /// 仍有 Pending 步骤但都无法运行
    Deadlock {
        /// 被阻塞的 Pending 步骤 id（插入顺序）
        blocked: Vec<String>,
        /// 阻塞根因：未能 Completed 的依赖（失败、跳过、或不存在），不含本身也被阻塞的步骤
        unresolved: Vec<String>,
    },
}

/// 收尾步骤的动作类型
pub const FINISH_ACTION: &str = "finish";

struct Index<'a> {
    status_of: HashMap<&'a str, StepStatus>,
    /// 是否还有未落定的非 finish 步骤
    work_open: bool,
}

impl<'a> Index<'a> {
    fn build(steps: &'a [PlanStep]) -> Self {
        Self {
            status_of: steps.iter().map(|s| (s.id.as_str(), s.status)).collect(),
            work_open: steps
                .iter()
                .any(|s| s.action_type != FINISH_ACTION && s.status.is_open()),
        }
    }

    fn is_runnable(&self, step: &PlanStep) -> bool {
        step.status == StepStatus::Pending
            && !(step.action_type == FINISH_ACTION && self.work_open)
            && step
                .dependencies
                .iter()
                .all(|d| self.status_of.get(d.as_str()) == Some(&StepStatus::Completed))
    }
}

/// 返回第一个可运行步骤
pub fn next_runnable(steps: &[PlanStep]) -> Option<&PlanStep> {
    let index = Index::build(steps);
    steps.iter().find(|s| index.is_runnable(s))
}

pub fn schedule(steps: &[PlanStep]) -> Schedule {
    let index = Index::build(steps);
    if let Some(idx) = steps.iter().position(|s| index.is_runnable(s)) {
        return Schedule::Runnable(idx);
    }
    let status_of = &index.status_of;

    let blocked: Vec<String> = steps
        .iter()
        .filter(|s| s.status == StepStatus::Pending)
        .map(|s| s.id.clone())
        .collect();
    if blocked.is_empty() {
        return Schedule::Exhausted;
    }

    let blocked_set: HashSet<&str> = blocked.iter().map(String::as_str).collect();
    let mut unresolved: Vec<String> = Vec::new();
    for step in steps.iter().filter(|s| s.status == StepStatus::Pending) {
        for dep in &step.dependencies {
            let root_cause = status_of.get(dep.as_str()) != Some(&StepStatus::Completed)
                && !blocked_set.contains(dep.as_str());
            if root_cause && !unresolved.contains(dep) {
                unresolved.push(dep.clone());
            }
        }
    }
    tracing::debug!(?blocked, ?unresolved, "scheduler found no runnable step");
    Schedule::Deadlock {
        blocked,
        unresolved,
    }
}

//! 任务记录（Task Record）：一次请求完整生命周期的状态
//!
//! - 输入（instruction / source_code）创建后不可变
//! - route / complexity 由分诊阶段写入且只写一次
//! - plan_steps 只追加；依赖只能引用更早出现的步骤，从构造上杜绝环
//! - task_complete 与 task_failed 互斥，任一为真后拒绝修改计划与工作记忆（日志除外）

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::error::EngineError;
use crate::core::step::{PlanStep, StepSpec, StepStatus};
use crate::core::task_scheduler;
use crate::memory::WorkingMemory;

/// 任务 ID（UUID v4，序列化为字符串）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| EngineError::TaskNotFound(s.to_string()))
    }
}

/// 分诊路线（闭集）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    SimpleInquiry,
    SimpleModification,
    ComplexModification,
    CodeGeneration,
    ResearchAndImplement,
}

impl Route {
    pub const ALL: [Route; 5] = [
        Route::SimpleInquiry,
        Route::SimpleModification,
        Route::ComplexModification,
        Route::CodeGeneration,
        Route::ResearchAndImplement,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Route::SimpleInquiry => "simple_inquiry",
            Route::SimpleModification => "simple_modification",
            Route::ComplexModification => "complex_modification",
            Route::CodeGeneration => "code_generation",
            Route::ResearchAndImplement => "research_and_implement",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Route {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Route::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| EngineError::ParseFailure(format!("unknown route '{s}'")))
    }
}

/// 编排状态机所处阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Triage,
    SimpleInquiry,
    Plan,
    Execute,
    Done,
    Failed,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }
}

/// 执行日志条目（按阶段打标签）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub phase: Phase,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// 单次阶段调用产生的计数增量
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Tally {
    pub llm_calls: u32,
    pub internal_searches: u32,
    pub external_searches: u32,
    pub files_modified: u32,
}

impl Tally {
    pub fn llm_call() -> Self {
        Self {
            llm_calls: 1,
            ..Self::default()
        }
    }
}

/// 仅用于观测，不参与控制决策
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub llm_calls: u32,
    pub internal_searches: u32,
    pub external_searches: u32,
    pub files_modified: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub elapsed_ms: Option<i64>,
}

impl ExecutionMetrics {
    fn start() -> Self {
        Self {
            llm_calls: 0,
            internal_searches: 0,
            external_searches: 0,
            files_modified: 0,
            started_at: Utc::now(),
            ended_at: None,
            elapsed_ms: None,
        }
    }

    pub fn absorb(&mut self, tally: &Tally) {
        self.llm_calls += tally.llm_calls;
        self.internal_searches += tally.internal_searches;
        self.external_searches += tally.external_searches;
        self.files_modified += tally.files_modified;
    }

    fn close(&mut self) {
        if self.ended_at.is_none() {
            let now = Utc::now();
            self.ended_at = Some(now);
            self.elapsed_ms = Some((now - self.started_at).num_milliseconds());
        }
    }
}

/// 进度摘要
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    /// completed / total；空计划为 0
    pub fraction: f64,
    pub current_step: Option<String>,
}

#[derive(Debug)]
pub struct TaskRecord {
    id: TaskId,
    instruction: String,
    source_code: String,
    current_code: String,
    route: Option<Route>,
    complexity: Option<u8>,
    phase: Phase,
    plan_steps: Vec<PlanStep>,
    working_memory: WorkingMemory,
    execution_log: Vec<LogEntry>,
    loop_count: u32,
    max_loops: u32,
    task_complete: bool,
    task_failed: bool,
    failure_reason: Option<String>,
    final_code: Option<String>,
    final_explanation: Option<String>,
    metrics: ExecutionMetrics,
    created_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(instruction: impl Into<String>, source_code: impl Into<String>, max_loops: u32) -> Self {
        let source_code = source_code.into();
        let mut record = Self {
            id: TaskId::new(),
            instruction: instruction.into(),
            current_code: source_code.clone(),
            source_code,
            route: None,
            complexity: None,
            phase: Phase::Triage,
            plan_steps: Vec::new(),
            working_memory: WorkingMemory::new(),
            execution_log: Vec::new(),
            loop_count: 0,
            max_loops,
            task_complete: false,
            task_failed: false,
            failure_reason: None,
            final_code: None,
            final_explanation: None,
            metrics: ExecutionMetrics::start(),
            created_at: Utc::now(),
        };
        record.log("Task started");
        record
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    pub fn source_code(&self) -> &str {
        &self.source_code
    }

    pub fn current_code(&self) -> &str {
        &self.current_code
    }

    pub fn route(&self) -> Option<Route> {
        self.route
    }

    pub fn complexity(&self) -> Option<u8> {
        self.complexity
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn plan_steps(&self) -> &[PlanStep] {
        &self.plan_steps
    }

    pub fn step(&self, id: &str) -> Option<&PlanStep> {
        self.plan_steps.iter().find(|s| s.id == id)
    }

    pub fn working_memory(&self) -> &WorkingMemory {
        &self.working_memory
    }

    pub fn execution_log(&self) -> &[LogEntry] {
        &self.execution_log
    }

    /// 对外暴露的有界日志视图（最后 n 条）
    pub fn recent_logs(&self, n: usize) -> &[LogEntry] {
        let start = self.execution_log.len().saturating_sub(n);
        &self.execution_log[start..]
    }

    pub fn loop_count(&self) -> u32 {
        self.loop_count
    }

    pub fn max_loops(&self) -> u32 {
        self.max_loops
    }

    pub fn task_complete(&self) -> bool {
        self.task_complete
    }

    pub fn task_failed(&self) -> bool {
        self.task_failed
    }

    pub fn is_terminal(&self) -> bool {
        self.task_complete || self.task_failed
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn final_code(&self) -> Option<&str> {
        self.final_code.as_deref()
    }

    pub fn final_explanation(&self) -> Option<&str> {
        self.final_explanation.as_deref()
    }

    pub fn metrics(&self) -> &ExecutionMetrics {
        &self.metrics
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    // ---------- 日志 ----------

    pub fn log(&mut self, message: impl Into<String>) {
        self.push_log(message.into(), None);
    }

    pub fn log_with(&mut self, message: impl Into<String>, data: Value) {
        self.push_log(message.into(), Some(data));
    }

    fn push_log(&mut self, message: String, data: Option<Value>) {
        self.execution_log.push(LogEntry {
            timestamp: Utc::now(),
            phase: self.phase,
            message,
            data,
        });
    }

    // ---------- 修改（终态后一律拒绝） ----------

    fn ensure_live(&self) -> Result<(), EngineError> {
        if self.is_terminal() {
            Err(EngineError::TaskTerminated(self.id))
        } else {
            Ok(())
        }
    }

    pub fn enter_phase(&mut self, phase: Phase) -> Result<(), EngineError> {
        self.ensure_live()?;
        self.phase = phase;
        Ok(())
    }

    pub fn set_route(&mut self, route: Route, complexity: u8) -> Result<(), EngineError> {
        self.ensure_live()?;
        if self.route.is_some() {
            return Err(EngineError::ClassificationFailure(
                "route already decided".to_string(),
            ));
        }
        self.route = Some(route);
        self.complexity = Some(complexity);
        self.log_with(
            format!("Route: {route} (complexity {complexity})"),
            serde_json::json!({ "route": route, "complexity": complexity }),
        );
        Ok(())
    }

    /// 追加步骤：id 全局唯一、依赖只能指向已存在（或同批更早）的步骤；整批校验通过才写入
    pub fn append_steps(&mut self, specs: Vec<StepSpec>) -> Result<usize, EngineError> {
        self.ensure_live()?;
        let mut known: Vec<&str> = self.plan_steps.iter().map(|s| s.id.as_str()).collect();
        for spec in &specs {
            if spec.id.trim().is_empty() {
                return Err(EngineError::InvalidPlan("step with empty id".to_string()));
            }
            if known.contains(&spec.id.as_str()) {
                return Err(EngineError::InvalidPlan(format!(
                    "duplicate step id '{}'",
                    spec.id
                )));
            }
            if let Some(dep) = spec
                .dependencies
                .iter()
                .find(|d| !known.contains(&d.as_str()))
            {
                return Err(EngineError::InvalidPlan(format!(
                    "step '{}' depends on unknown or later step '{dep}'",
                    spec.id
                )));
            }
            known.push(&spec.id);
        }
        let added = specs.len();
        self.plan_steps.extend(specs.into_iter().map(PlanStep::from));
        Ok(added)
    }

    fn step_mut(&mut self, id: &str) -> Result<&mut PlanStep, EngineError> {
        self.plan_steps
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| EngineError::InvalidPlan(format!("no step with id '{id}'")))
    }

    /// 同一时刻至多一个 InProgress 步骤
    pub fn begin_step(&mut self, id: &str) -> Result<(), EngineError> {
        self.ensure_live()?;
        if let Some(running) = self
            .plan_steps
            .iter()
            .find(|s| s.status == StepStatus::InProgress)
        {
            return Err(EngineError::InvalidTransition {
                step_id: running.id.clone(),
                from: StepStatus::InProgress,
                to: StepStatus::InProgress,
            });
        }
        let step = self.step_mut(id)?;
        step.transition(StepStatus::InProgress)?;
        let message = format!("Executing step {}: {}", step.id, step.description);
        self.log(message);
        Ok(())
    }

    pub fn complete_step(&mut self, id: &str) -> Result<(), EngineError> {
        self.ensure_live()?;
        self.step_mut(id)?.transition(StepStatus::Completed)?;
        self.log(format!("Step {id} completed"));
        Ok(())
    }

    pub fn fail_step(&mut self, id: &str, reason: &str) -> Result<(), EngineError> {
        self.ensure_live()?;
        let step = self.step_mut(id)?;
        step.transition(StepStatus::Failed)?;
        step.error_message = Some(reason.to_string());
        self.log(format!("Step {id} failed: {reason}"));
        Ok(())
    }

    pub fn skip_step(&mut self, id: &str) -> Result<(), EngineError> {
        self.ensure_live()?;
        self.step_mut(id)?.transition(StepStatus::Skipped)?;
        self.log(format!("Step {id} skipped"));
        Ok(())
    }

    pub fn insert_memory(&mut self, key: impl Into<String>, value: Value) -> Result<(), EngineError> {
        self.ensure_live()?;
        self.working_memory.insert(key, value);
        Ok(())
    }

    pub fn cache_search(&mut self, query: &str, results: Value) -> Result<(), EngineError> {
        self.ensure_live()?;
        self.working_memory.cache_search_results(query, results);
        Ok(())
    }

    pub fn set_current_code(&mut self, code: impl Into<String>) -> Result<(), EngineError> {
        self.ensure_live()?;
        self.current_code = code.into();
        Ok(())
    }

    /// loop_count 只增不减，返回自增后的值
    pub fn advance_loop(&mut self) -> Result<u32, EngineError> {
        self.ensure_live()?;
        self.loop_count += 1;
        Ok(self.loop_count)
    }

    /// 计数属于观测数据，终态后仍可累加
    pub fn record_tally(&mut self, tally: &Tally) {
        self.metrics.absorb(tally);
    }

    /// 成功终止
    pub fn finish(
        &mut self,
        explanation: impl Into<String>,
        code: impl Into<String>,
    ) -> Result<(), EngineError> {
        self.ensure_live()?;
        self.final_explanation = Some(explanation.into());
        self.final_code = Some(code.into());
        self.log("Task completed");
        self.task_complete = true;
        self.phase = Phase::Done;
        self.metrics.close();
        Ok(())
    }

    /// 失败终止：先写日志再置标志；已是终态时不做任何事并返回 false
    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        let mut reason = reason.into();
        if reason.trim().is_empty() {
            reason = "task failed".to_string();
        }
        self.log(format!("Task failed: {reason}"));
        self.failure_reason = Some(reason);
        self.task_failed = true;
        self.phase = Phase::Failed;
        self.metrics.close();
        true
    }

    pub fn progress(&self) -> Progress {
        let total = self.plan_steps.len();
        let completed = self
            .plan_steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        let fraction = if total == 0 {
            0.0
        } else {
            completed as f64 / total as f64
        };
        let current_step = self
            .plan_steps
            .iter()
            .find(|s| s.status == StepStatus::InProgress)
            .or_else(|| task_scheduler::next_runnable(&self.plan_steps))
            .map(|s| s.description.clone());
        Progress {
            completed,
            total,
            fraction,
            current_step,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> TaskRecord {
        TaskRecord::new("add logging", "fn main() {}", 10)
    }

    #[test]
    fn test_new_record_logs_start() {
        let r = record();
        assert_eq!(r.current_code(), "fn main() {}");
        assert_eq!(r.phase(), Phase::Triage);
        assert_eq!(r.execution_log()[0].message, "Task started");
        assert!(!r.is_terminal());
    }

    #[test]
    fn test_route_is_set_once() {
        let mut r = record();
        r.set_route(Route::CodeGeneration, 5).unwrap();
        assert!(r.set_route(Route::SimpleInquiry, 1).is_err());
        assert_eq!(r.route(), Some(Route::CodeGeneration));
    }

    #[test]
    fn test_route_parses_case_insensitively() {
        assert_eq!(
            "Complex_Modification".parse::<Route>().unwrap(),
            Route::ComplexModification
        );
        assert!("rewrite_everything".parse::<Route>().is_err());
    }

    #[test]
    fn test_append_rejects_forward_reference() {
        let mut r = record();
        let err = r
            .append_steps(vec![
                StepSpec::new("a", "search_internal").depends_on("b"),
                StepSpec::new("b", "finish"),
            ])
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidPlan(_)));
        assert!(r.plan_steps().is_empty());
    }

    #[test]
    fn test_append_rejects_duplicate_id_across_batches() {
        let mut r = record();
        r.append_steps(vec![StepSpec::new("a", "search_internal")]).unwrap();
        assert!(r.append_steps(vec![StepSpec::new("a", "write_file")]).is_err());
        r.append_steps(vec![StepSpec::new("b", "write_file").depends_on("a")])
            .unwrap();
        assert_eq!(r.plan_steps().len(), 2);
    }

    #[test]
    fn test_only_one_step_in_progress() {
        let mut r = record();
        r.append_steps(vec![
            StepSpec::new("a", "search_internal"),
            StepSpec::new("b", "search_internal"),
        ])
        .unwrap();
        r.begin_step("a").unwrap();
        assert!(r.begin_step("b").is_err());
        r.complete_step("a").unwrap();
        r.begin_step("b").unwrap();
    }

    #[test]
    fn test_terminal_record_rejects_mutation() {
        let mut r = record();
        r.append_steps(vec![StepSpec::new("a", "search_internal")]).unwrap();
        assert!(r.fail("boom"));
        assert!(!r.fail("again"));

        assert!(matches!(
            r.insert_memory("k", json!(1)),
            Err(EngineError::TaskTerminated(_))
        ));
        assert!(r.append_steps(vec![StepSpec::new("b", "finish")]).is_err());
        assert!(r.begin_step("a").is_err());
        assert!(r.finish("x", "y").is_err());
        assert!(r.advance_loop().is_err());
        assert_eq!(r.failure_reason(), Some("boom"));
        assert!(!r.task_complete());
        assert_eq!(r.phase(), Phase::Failed);
    }

    #[test]
    fn test_failure_is_logged_before_flag() {
        let mut r = record();
        r.fail("planner exploded");
        let last = r.execution_log().last().unwrap();
        assert!(last.message.contains("planner exploded"));
        assert!(r.metrics().ended_at.is_some());
    }

    #[test]
    fn test_progress_reports_current_step() {
        let mut r = record();
        r.append_steps(vec![
            StepSpec::new("a", "search_internal").describe("look up config"),
            StepSpec::new("b", "finish").depends_on("a").describe("wrap up"),
        ])
        .unwrap();
        assert_eq!(r.progress().current_step.as_deref(), Some("look up config"));

        r.begin_step("a").unwrap();
        r.complete_step("a").unwrap();
        let p = r.progress();
        assert_eq!((p.completed, p.total), (1, 2));
        assert!((p.fraction - 0.5).abs() < f64::EPSILON);
        assert_eq!(p.current_step.as_deref(), Some("wrap up"));
    }

    #[test]
    fn test_recent_logs_is_bounded() {
        let mut r = record();
        for i in 0..30 {
            r.log(format!("entry {i}"));
        }
        assert_eq!(r.execution_log().len(), 31);
        let view = r.recent_logs(20);
        assert_eq!(view.len(), 20);
        assert_eq!(view.last().unwrap().message, "entry 29");
    }
}

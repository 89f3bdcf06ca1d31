//! 编排器：任务状态机主控循环
//!
//! Triage → SimpleInquiry → Done，或 Triage → Plan → Execute（自循环）→ Done | Failed。
//! 每次状态迁移后发布一次快照；终态快照由 publish_final 发出，随后安排保留期淘汰。
//!
//! 每个外部调用都是挂起点：调用前后各检查一次终态标志与取消令牌，挂起期间不持有任何锁。
//! 取消在下一个检查点生效，进行中的调用 future 直接被丢弃。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::core::error::EngineError;
use crate::core::progress::{progress_channel, ProgressPublisher, ProgressReceiver, TaskSnapshot};
use crate::core::recovery::{FailureSite, RecoveryAction, RecoveryEngine};
use crate::core::registry::{TaskHandle, TaskRegistry, TaskSummary};
use crate::core::state::{Phase, Route, Tally, TaskId};
use crate::core::task_scheduler::{schedule, Schedule};
use crate::llm::LlmClient;
use crate::stages::{Artifact, Classifier, Developer, Planner};
use crate::tools::{CodeHistory, ToolExecutor};

/// 各阶段共享的显式上下文（无全局单例）
pub struct EngineContext {
    pub registry: Arc<TaskRegistry>,
    pub tools: Arc<ToolExecutor>,
    /// 已带重试的模型客户端
    pub llm: Arc<dyn LlmClient>,
    pub recovery: RecoveryEngine,
    /// write_file 的写入历史（跨任务共享）
    pub code_history: Arc<CodeHistory>,
    pub settings: AppConfig,
}

/// submit 的返回：任务 id、进度流、以及返回终态快照的后台任务
pub struct SubmittedTask {
    pub task_id: TaskId,
    pub progress: ProgressReceiver,
    pub handle: JoinHandle<TaskSnapshot>,
}

pub struct Orchestrator {
    ctx: Arc<EngineContext>,
    classifier: Classifier,
    planner: Planner,
    developer: Developer,
}

impl Orchestrator {
    pub fn new(ctx: EngineContext) -> Self {
        let classifier = Classifier::new(ctx.llm.clone());
        let planner = Planner::new(
            ctx.llm.clone(),
            ctx.tools.clone(),
            ctx.recovery.clone(),
            ctx.settings.planner.clone(),
        );
        let developer = Developer::new(ctx.llm.clone(), ctx.tools.clone());
        Self {
            ctx: Arc::new(ctx),
            classifier,
            planner,
            developer,
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.ctx.registry
    }

    /// 最近 limit 次文件写入（新的在前），含统一 diff
    pub fn code_history(&self, limit: usize) -> Vec<serde_json::Value> {
        self.ctx.code_history.recent(limit)
    }

    fn open_channel(&self, task_id: TaskId) -> (ProgressPublisher, ProgressReceiver) {
        let p = &self.ctx.settings.progress;
        progress_channel(
            task_id,
            p.capacity,
            Duration::from_millis(p.send_timeout_ms),
            Duration::from_millis(p.final_timeout_ms),
        )
    }

    /// 创建任务并在后台运行
    pub async fn submit(
        self: &Arc<Self>,
        instruction: impl Into<String>,
        source_code: impl Into<String>,
    ) -> Result<SubmittedTask, EngineError> {
        let (task_id, handle) = self
            .ctx
            .registry
            .create(instruction, source_code, self.ctx.settings.engine.max_loops)
            .await?;
        let (publisher, progress) = self.open_channel(task_id);
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run(handle, publisher).await });
        Ok(SubmittedTask {
            task_id,
            progress,
            handle,
        })
    }

    /// 在当前任务中同步跑完，不订阅进度
    pub async fn execute(
        &self,
        instruction: impl Into<String>,
        source_code: impl Into<String>,
    ) -> Result<TaskSnapshot, EngineError> {
        let (task_id, handle) = self
            .ctx
            .registry
            .create(instruction, source_code, self.ctx.settings.engine.max_loops)
            .await?;
        let (publisher, progress) = self.open_channel(task_id);
        drop(progress);
        Ok(self.run(handle, publisher).await)
    }

    pub async fn get(&self, task_id: &TaskId) -> Result<TaskSnapshot, EngineError> {
        self.ctx.registry.get(task_id).await
    }

    pub async fn cancel(&self, task_id: &TaskId) -> Result<bool, EngineError> {
        self.ctx.registry.cancel(task_id).await
    }

    pub async fn delete(&self, task_id: &TaskId) -> bool {
        self.ctx.registry.delete(task_id).await
    }

    pub async fn list(&self) -> Vec<TaskSummary> {
        self.ctx.registry.list().await
    }

    /// 状态机主循环，返回终态快照
    pub async fn run(&self, handle: TaskHandle, mut publisher: ProgressPublisher) -> TaskSnapshot {
        let task_id = publisher.task_id();
        tracing::info!(task_id = %task_id, "task started");
        self.publish(&handle, &mut publisher).await;

        loop {
            let phase = {
                let record = handle.record.lock().await;
                if record.is_terminal() {
                    break;
                }
                record.phase()
            };
            tracing::debug!(task_id = %task_id, phase = ?phase, "entering phase");

            let result = match phase {
                Phase::Triage => self.triage(&handle).await,
                Phase::SimpleInquiry => self.answer_inquiry(&handle).await,
                Phase::Plan => self.plan(&handle).await,
                Phase::Execute => self.execute_next(&handle, &mut publisher).await,
                Phase::Done | Phase::Failed => break,
            };

            if let Err(err) = result {
                let reason = match err {
                    EngineError::Cancelled(reason) => reason,
                    EngineError::TaskTerminated(_) => {
                        self.ctx.registry.cancellation_reason().to_string()
                    }
                    other => other.to_string(),
                };
                if handle.record.lock().await.fail(&reason) {
                    tracing::warn!(task_id = %task_id, phase = ?phase, reason = %reason, "task failed");
                }
            }

            if handle.record.lock().await.is_terminal() {
                break;
            }
            self.publish(&handle, &mut publisher).await;
        }

        let snapshot = {
            let record = handle.record.lock().await;
            TaskSnapshot::capture(&record, self.ctx.settings.engine.log_view)
        };
        tracing::info!(
            task_id = %task_id,
            complete = snapshot.task_complete,
            failed = snapshot.task_failed,
            loops = snapshot.loop_count,
            "task finished"
        );
        publisher.publish_final(snapshot.clone()).await;
        self.ctx.registry.schedule_eviction(task_id);
        snapshot
    }

    async fn publish(&self, handle: &TaskHandle, publisher: &mut ProgressPublisher) {
        if publisher.is_detached() {
            return;
        }
        let snapshot = {
            let record = handle.record.lock().await;
            TaskSnapshot::capture(&record, self.ctx.settings.engine.log_view)
        };
        publisher.publish(snapshot).await;
    }

    fn cancelled(&self) -> EngineError {
        EngineError::Cancelled(self.ctx.registry.cancellation_reason().to_string())
    }

    /// 终态或取消时返回错误
    async fn checkpoint(&self, handle: &TaskHandle) -> Result<(), EngineError> {
        if handle.cancel.is_cancelled() {
            return Err(self.cancelled());
        }
        let record = handle.record.lock().await;
        if record.is_terminal() {
            return Err(EngineError::TaskTerminated(record.id()));
        }
        Ok(())
    }

    /// 挂起点：前后检查点 + 与取消令牌竞争
    async fn guarded<F, T>(&self, handle: &TaskHandle, fut: F) -> Result<T, EngineError>
    where
        F: Future<Output = T>,
    {
        self.checkpoint(handle).await?;
        let out = tokio::select! {
            biased;
            _ = handle.cancel.cancelled() => {
                return Err(self.cancelled());
            }
            out = fut => out,
        };
        self.checkpoint(handle).await?;
        Ok(out)
    }

    async fn triage(&self, handle: &TaskHandle) -> Result<(), EngineError> {
        let (instruction, code) = {
            let record = handle.record.lock().await;
            (record.instruction().to_string(), record.source_code().to_string())
        };
        let assessment = self
            .guarded(handle, self.classifier.classify(&instruction, &code))
            .await?;

        let mut record = handle.record.lock().await;
        record.record_tally(&Tally::llm_call());
        if let Some(reason) = &assessment.fallback_reason {
            record.log_with(
                "Triage failed, defaulting to the most capable route",
                json!({ "error": reason }),
            );
        }
        record.set_route(assessment.route, assessment.complexity)?;
        let next = if assessment.route == Route::SimpleInquiry {
            Phase::SimpleInquiry
        } else {
            Phase::Plan
        };
        record.enter_phase(next)?;
        tracing::info!(
            task_id = %record.id(),
            route = %assessment.route,
            complexity = assessment.complexity,
            "triage complete"
        );
        Ok(())
    }

    async fn answer_inquiry(&self, handle: &TaskHandle) -> Result<(), EngineError> {
        let (instruction, code) = {
            let record = handle.record.lock().await;
            (record.instruction().to_string(), record.current_code().to_string())
        };
        let mut tally = Tally::default();
        let answer = self
            .guarded(
                handle,
                self.developer.answer_inquiry(&instruction, &code, &mut tally),
            )
            .await?;

        let mut record = handle.record.lock().await;
        record.record_tally(&tally);
        let answer = answer?;
        record.log("Inquiry answered");
        let final_code = record.current_code().to_string();
        record.finish(answer, final_code)
    }

    async fn plan(&self, handle: &TaskHandle) -> Result<(), EngineError> {
        let (instruction, code) = {
            let mut record = handle.record.lock().await;
            record.log("Gathering context");
            (record.instruction().to_string(), record.current_code().to_string())
        };

        let mut tally = Tally::default();
        let context = self
            .guarded(handle, self.planner.gather_context(&instruction, &mut tally))
            .await?;
        {
            let mut record = handle.record.lock().await;
            record.record_tally(&tally);
            record.cache_search(&context.query, json!(context.hits))?;
            record.log_with(
                format!("Context gathered: {} search results", context.hits.len()),
                json!({ "summary": context.summary }),
            );
        }

        let mut tally = Tally::default();
        let steps = self
            .guarded(
                handle,
                self.planner
                    .generate_plan(&instruction, &code, &context, &mut tally),
            )
            .await?;

        let mut record = handle.record.lock().await;
        record.record_tally(&tally);
        let steps = steps?;
        let count = record.append_steps(steps)?;
        let outline: Vec<_> = record
            .plan_steps()
            .iter()
            .map(|s| json!({ "id": s.id, "action_type": s.action_type, "description": s.description }))
            .collect();
        record.log_with(format!("Planned {count} steps"), json!(outline));
        record.enter_phase(Phase::Execute)?;
        tracing::info!(task_id = %record.id(), steps = count, "entering execute phase");
        Ok(())
    }

    /// Execute 自循环的一次迭代
    async fn execute_next(
        &self,
        handle: &TaskHandle,
        publisher: &mut ProgressPublisher,
    ) -> Result<(), EngineError> {
        let (step, code) = {
            let mut record = handle.record.lock().await;
            match schedule(record.plan_steps()) {
                Schedule::Runnable(idx) => {
                    if record.loop_count() >= record.max_loops() {
                        return Err(EngineError::LoopCeilingExceeded {
                            loops: record.loop_count(),
                            max: record.max_loops(),
                        });
                    }
                    record.advance_loop()?;
                    let step = record.plan_steps()[idx].clone();
                    record.begin_step(&step.id)?;
                    (step, record.current_code().to_string())
                }
                Schedule::Exhausted => {
                    return Err(EngineError::InvalidPlan(
                        "plan exhausted without a finish step".to_string(),
                    ));
                }
                Schedule::Deadlock {
                    blocked,
                    unresolved,
                } => {
                    for id in &blocked {
                        record.skip_step(id)?;
                    }
                    return Err(EngineError::SchedulerDeadlock {
                        blocked,
                        unresolved,
                    });
                }
            }
        };
        tracing::debug!(step_id = %step.id, action = %step.action_type, "executing step");
        self.publish(handle, publisher).await;

        let mut tally = Tally::default();
        let result = self
            .guarded(handle, self.developer.execute(&step, &code, &mut tally))
            .await?;

        let mut record = handle.record.lock().await;
        record.record_tally(&tally);
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                record.fail_step(&step.id, &err.to_string())?;
                return match self.ctx.recovery.handle(
                    &err,
                    FailureSite::Step {
                        action_type: &step.action_type,
                    },
                ) {
                    RecoveryAction::Continue => {
                        record.log(format!("Step {} is non-critical, continuing", step.id));
                        Ok(())
                    }
                    RecoveryAction::Abort(reason) => {
                        tracing::warn!(task_id = %record.id(), step_id = %step.id, reason = %reason, "task failed");
                        record.fail(reason);
                        Ok(())
                    }
                    RecoveryAction::Reask => Err(err),
                };
            }
        };

        record.complete_step(&step.id)?;
        match outcome.artifact {
            Artifact::SearchHits { query, hits } => {
                let value = json!(hits);
                record.insert_memory(format!("search_results_{}", step.id), value.clone())?;
                record.cache_search(&query, value)?;
            }
            Artifact::FileWritten { path, content, diff } => {
                record.set_current_code(content)?;
                record.insert_memory(format!("diff_{}", step.id), json!(diff))?;
                record.log_with(format!("File written: {path}"), json!({ "path": path }));
            }
            Artifact::Analysis(text) => {
                record.insert_memory(format!("analysis_{}", step.id), json!(text))?;
            }
            Artifact::Finished { explanation, code } => {
                return record.finish(explanation, code);
            }
        }
        if !outcome.follow_up.is_empty() {
            let added = record.append_steps(outcome.follow_up)?;
            record.log(format!("Step {} added {added} follow-up steps", step.id));
        }
        Ok(())
    }
}

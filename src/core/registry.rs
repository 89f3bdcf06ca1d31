//! 任务注册表：进程内唯一的共享可变结构，TaskId -> 活跃任务记录
//!
//! 锁顺序固定为「注册表 → 任务记录」；任务记录的锁从不跨外部调用持有。
//! 容量有限：满时淘汰最早的终态任务，没有终态任务则拒绝创建。
//! 终态任务在 retention 后由独立定时器删除，删除是幂等的。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::error::EngineError;
use crate::core::progress::TaskSnapshot;
use crate::core::state::{Route, TaskId, TaskRecord};

pub const CANCELLED_BY_USER: &str = "Task cancelled by user";
pub const ENGINE_SHUTDOWN: &str = "Task interrupted by engine shutdown";

/// 注册表中的一项：任务记录 + 取消令牌
#[derive(Clone)]
pub struct TaskHandle {
    pub record: Arc<Mutex<TaskRecord>>,
    pub cancel: CancellationToken,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
}

/// list() 返回的任务摘要
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: TaskId,
    pub instruction: String,
    pub status: TaskStatus,
    pub route: Option<Route>,
    pub progress: f64,
    pub created_at: DateTime<Utc>,
}

impl TaskSummary {
    fn of(record: &TaskRecord) -> Self {
        let status = if record.task_complete() {
            TaskStatus::Completed
        } else if record.task_failed() {
            TaskStatus::Failed
        } else {
            TaskStatus::Running
        };
        Self {
            task_id: record.id(),
            instruction: record.instruction().to_string(),
            status,
            route: record.route(),
            progress: record.progress().fraction,
            created_at: record.created_at(),
        }
    }
}

pub struct TaskRegistry {
    tasks: RwLock<HashMap<TaskId, TaskHandle>>,
    max_tasks: usize,
    retention: Duration,
    log_view: usize,
    /// 关闭时唤醒所有保留期定时器
    shutdown: CancellationToken,
}

impl TaskRegistry {
    pub fn new(max_tasks: usize, retention: Duration, log_view: usize) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            max_tasks: max_tasks.max(1),
            retention,
            log_view,
            shutdown: CancellationToken::new(),
        }
    }

    /// 创建任务并登记；满时先淘汰最早的终态任务
    pub async fn create(
        &self,
        instruction: impl Into<String>,
        source_code: impl Into<String>,
        max_loops: u32,
    ) -> Result<(TaskId, TaskHandle), EngineError> {
        let record = TaskRecord::new(instruction, source_code, max_loops);
        let task_id = record.id();
        let handle = TaskHandle {
            record: Arc::new(Mutex::new(record)),
            cancel: self.shutdown.child_token(),
        };

        let mut tasks = self.tasks.write().await;
        if tasks.len() >= self.max_tasks {
            let mut oldest: Option<(DateTime<Utc>, TaskId)> = None;
            for (id, h) in tasks.iter() {
                let record = h.record.lock().await;
                if record.is_terminal() && oldest.map_or(true, |(at, _)| record.created_at() < at) {
                    oldest = Some((record.created_at(), *id));
                }
            }
            match oldest {
                Some((_, victim)) => {
                    tasks.remove(&victim);
                    tracing::info!(task_id = %victim, "registry full, evicted oldest finished task");
                }
                None => return Err(EngineError::RegistryFull(tasks.len())),
            }
        }
        tasks.insert(task_id, handle.clone());
        tracing::info!(task_id = %task_id, live = tasks.len(), "task created");
        Ok((task_id, handle))
    }

    pub async fn handle(&self, task_id: &TaskId) -> Option<TaskHandle> {
        self.tasks.read().await.get(task_id).cloned()
    }

    /// 当前快照
    pub async fn get(&self, task_id: &TaskId) -> Result<TaskSnapshot, EngineError> {
        let handle = self
            .handle(task_id)
            .await
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        let record = handle.record.lock().await;
        Ok(TaskSnapshot::capture(&record, self.log_view))
    }

    /// 以失败终止任务并触发取消；已是终态时返回 Ok(false)
    pub async fn cancel(&self, task_id: &TaskId) -> Result<bool, EngineError> {
        let handle = self
            .handle(task_id)
            .await
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        let newly_failed = handle.record.lock().await.fail(CANCELLED_BY_USER);
        handle.cancel.cancel();
        if newly_failed {
            tracing::info!(task_id = %task_id, "task cancelled");
        }
        Ok(newly_failed)
    }

    /// 幂等删除：返回条目是否存在；运行中的任务同时被取消
    pub async fn delete(&self, task_id: &TaskId) -> bool {
        let removed = self.tasks.write().await.remove(task_id);
        match removed {
            Some(handle) => {
                handle.cancel.cancel();
                tracing::debug!(task_id = %task_id, "task removed from registry");
                true
            }
            None => false,
        }
    }

    pub async fn list(&self) -> Vec<TaskSummary> {
        let handles: Vec<TaskHandle> = self.tasks.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            summaries.push(TaskSummary::of(&*handle.record.lock().await));
        }
        summaries.sort_by_key(|s| s.created_at);
        summaries
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// retention 之后删除任务；条目可能已被删除
    pub fn schedule_eviction(self: &Arc<Self>, task_id: TaskId) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        let retention = self.retention;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(retention) => {
                    if registry.delete(&task_id).await {
                        tracing::debug!(task_id = %task_id, "retention expired");
                    }
                }
                _ = shutdown.cancelled() => {}
            }
        })
    }

    /// 取消所有任务与定时器
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!("task registry shutting down");
        }
        self.shutdown.cancel();
    }

    /// 令牌被触发而记录尚未终止时使用的失败原因
    pub fn cancellation_reason(&self) -> &'static str {
        if self.shutdown.is_cancelled() {
            ENGINE_SHUTDOWN
        } else {
            CANCELLED_BY_USER
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(max_tasks: usize) -> Arc<TaskRegistry> {
        Arc::new(TaskRegistry::new(max_tasks, Duration::from_secs(60), 20))
    }

    #[tokio::test]
    async fn test_create_get_list() {
        let reg = registry(8);
        let (id, _) = reg.create("explain main", "fn main() {}", 10).await.unwrap();

        let snap = reg.get(&id).await.unwrap();
        assert_eq!(snap.task_id, id);
        assert_eq!(snap.instruction, "explain main");

        let list = reg.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].status, TaskStatus::Running);
        assert!(matches!(
            reg.get(&TaskId::new()).await,
            Err(EngineError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let reg = registry(8);
        let (id, handle) = reg.create("x", "", 10).await.unwrap();

        assert!(reg.cancel(&id).await.unwrap());
        assert!(handle.cancel.is_cancelled());
        assert!(!reg.cancel(&id).await.unwrap());

        let snap = reg.get(&id).await.unwrap();
        assert!(snap.task_failed);
        assert_eq!(snap.failure_reason.as_deref(), Some(CANCELLED_BY_USER));
        assert!(matches!(
            reg.cancel(&TaskId::new()).await,
            Err(EngineError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let reg = registry(8);
        let (id, handle) = reg.create("x", "", 10).await.unwrap();
        assert!(reg.delete(&id).await);
        assert!(!reg.delete(&id).await);
        assert!(handle.cancel.is_cancelled());
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn test_full_registry_evicts_oldest_terminal() {
        let reg = registry(2);
        let (first, h1) = reg.create("one", "", 10).await.unwrap();
        let (second, _) = reg.create("two", "", 10).await.unwrap();

        assert!(matches!(
            reg.create("three", "", 10).await,
            Err(EngineError::RegistryFull(2))
        ));

        h1.record.lock().await.fail("done with it");
        let (third, _) = reg.create("three", "", 10).await.unwrap();
        assert!(reg.handle(&first).await.is_none());
        assert!(reg.handle(&second).await.is_some());
        assert!(reg.handle(&third).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_timer_evicts() {
        let reg = registry(8);
        let (id, _) = reg.create("x", "", 10).await.unwrap();
        let timer = reg.schedule_eviction(id);

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(reg.handle(&id).await.is_some());
        timer.await.unwrap();
        assert!(reg.handle(&id).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_timer_tolerates_prior_removal() {
        let reg = registry(8);
        let (id, _) = reg.create("x", "", 10).await.unwrap();
        let timer = reg.schedule_eviction(id);
        assert!(reg.delete(&id).await);
        timer.await.unwrap();
        assert_eq!(reg.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_timers() {
        let reg = registry(8);
        let (id, handle) = reg.create("x", "", 10).await.unwrap();
        let timer = reg.schedule_eviction(id);
        assert_eq!(reg.cancellation_reason(), CANCELLED_BY_USER);
        reg.shutdown();
        timer.await.unwrap();
        assert!(reg.handle(&id).await.is_some());
        assert!(handle.cancel.is_cancelled());
        assert_eq!(reg.cancellation_reason(), ENGINE_SHUTDOWN);
    }
}

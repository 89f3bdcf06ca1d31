//! 进度通道：单生产者 / 单消费者的有界队列，每次状态迁移发布一次任务快照
//!
//! - 慢消费者：发送最多阻塞 send_timeout，超时后改发心跳占位（非阻塞）并丢弃本次快照。
//!   队列比 capacity 多一格，快照只有在发送后仍留有空位时才入队，这一格留给心跳；
//!   已有心跳在队列中未被读走时不再追加
//! - 顺序：seq 严格递增，消费者不会先看到较新的状态
//! - 终态快照由 publish_final 发送，它消费掉发布者，因此一定是最后一条

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::SendError, error::SendTimeoutError, error::TrySendError};

use crate::core::state::{ExecutionMetrics, LogEntry, Phase, Progress, Route, TaskId, TaskRecord};
use crate::core::step::StepStatus;

/// 快照中的步骤视图
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepView {
    pub id: String,
    pub description: String,
    pub action_type: String,
    pub status: StepStatus,
    pub reasoning: String,
}

/// 任务记录在某一时刻的可序列化快照
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    /// 由发布者分配；未经通道发布时为 0
    pub seq: u64,
    pub instruction: String,
    pub route: Option<Route>,
    pub complexity: Option<u8>,
    pub phase: Phase,
    pub plan_steps: Vec<StepView>,
    pub logs: Vec<LogEntry>,
    pub progress: Progress,
    pub task_complete: bool,
    pub task_failed: bool,
    pub failure_reason: Option<String>,
    pub final_code: Option<String>,
    pub final_explanation: Option<String>,
    pub metrics: ExecutionMetrics,
    pub loop_count: u32,
    pub max_loops: u32,
}

impl TaskSnapshot {
    pub fn capture(record: &TaskRecord, log_view: usize) -> Self {
        Self {
            task_id: record.id(),
            seq: 0,
            instruction: record.instruction().to_string(),
            route: record.route(),
            complexity: record.complexity(),
            phase: record.phase(),
            plan_steps: record
                .plan_steps()
                .iter()
                .map(|s| StepView {
                    id: s.id.clone(),
                    description: s.description.clone(),
                    action_type: s.action_type.clone(),
                    status: s.status,
                    reasoning: s.reasoning.clone(),
                })
                .collect(),
            logs: record.recent_logs(log_view).to_vec(),
            progress: record.progress(),
            task_complete: record.task_complete(),
            task_failed: record.task_failed(),
            failure_reason: record.failure_reason().map(String::from),
            final_code: record.final_code().map(String::from),
            final_explanation: record.final_explanation().map(String::from),
            metrics: record.metrics().clone(),
            loop_count: record.loop_count(),
            max_loops: record.max_loops(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.task_complete || self.task_failed
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Snapshot(TaskSnapshot),
    /// 慢消费者时替代快照的占位
    Heartbeat {
        task_id: TaskId,
        seq: u64,
        timestamp: DateTime<Utc>,
    },
}

impl ProgressEvent {
    pub fn seq(&self) -> u64 {
        match self {
            ProgressEvent::Snapshot(s) => s.seq,
            ProgressEvent::Heartbeat { seq, .. } => *seq,
        }
    }

    /// 任一终态标志出现即流结束
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, ProgressEvent::Snapshot(s) if s.is_terminal())
    }
}

/// 单次发布的结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered,
    /// 快照超时未送达，改为心跳
    Heartbeat,
    /// 快照与心跳都未送达
    Dropped,
    /// 消费者已离开，之后的发布全部跳过
    Detached,
}

pub struct ProgressPublisher {
    task_id: TaskId,
    tx: Option<mpsc::Sender<ProgressEvent>>,
    seq: u64,
    send_timeout: Duration,
    final_timeout: Duration,
    dropped: u64,
}

pub struct ProgressReceiver {
    rx: mpsc::Receiver<ProgressEvent>,
}

pub fn progress_channel(
    task_id: TaskId,
    capacity: usize,
    send_timeout: Duration,
    final_timeout: Duration,
) -> (ProgressPublisher, ProgressReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1) + 1);
    (
        ProgressPublisher {
            task_id,
            tx: Some(tx),
            seq: 0,
            send_timeout,
            final_timeout,
            dropped: 0,
        },
        ProgressReceiver { rx },
    )
}

impl ProgressPublisher {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// 因队列满而丢弃的快照数
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn is_detached(&self) -> bool {
        self.tx.is_none()
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    pub async fn publish(&mut self, mut snapshot: TaskSnapshot) -> PublishOutcome {
        let Some(tx) = self.tx.clone() else {
            return PublishOutcome::Detached;
        };
        snapshot.seq = self.next_seq();

        let reserved = tokio::time::timeout(self.send_timeout, async {
            let permit = tx.reserve().await?;
            // 再占一格：确认快照入队后仍留有心跳的位置
            let spare = tx.reserve().await?;
            drop(spare);
            Ok::<_, SendError<()>>(permit)
        })
        .await;

        match reserved {
            Ok(Ok(permit)) => {
                permit.send(ProgressEvent::Snapshot(snapshot));
                PublishOutcome::Delivered
            }
            Ok(Err(_)) => self.detach(),
            Err(_) => {
                self.dropped += 1;
                let heartbeat = ProgressEvent::Heartbeat {
                    task_id: self.task_id,
                    seq: self.next_seq(),
                    timestamp: Utc::now(),
                };
                match tx.try_send(heartbeat) {
                    Ok(()) => {
                        tracing::warn!(
                            task_id = %self.task_id,
                            dropped = self.dropped,
                            "progress consumer is slow, heartbeat sent instead of snapshot"
                        );
                        PublishOutcome::Heartbeat
                    }
                    Err(TrySendError::Closed(_)) => self.detach(),
                    Err(TrySendError::Full(_)) => {
                        tracing::debug!(
                            task_id = %self.task_id,
                            dropped = self.dropped,
                            "heartbeat still pending, snapshot dropped"
                        );
                        PublishOutcome::Dropped
                    }
                }
            }
        }
    }

    /// 发布终态快照并关闭通道
    pub async fn publish_final(mut self, mut snapshot: TaskSnapshot) -> PublishOutcome {
        let Some(tx) = self.tx.take() else {
            return PublishOutcome::Detached;
        };
        snapshot.seq = self.next_seq();
        match tx
            .send_timeout(ProgressEvent::Snapshot(snapshot), self.final_timeout)
            .await
        {
            Ok(()) => PublishOutcome::Delivered,
            Err(SendTimeoutError::Closed(_)) => PublishOutcome::Detached,
            Err(SendTimeoutError::Timeout(_)) => {
                tracing::warn!(task_id = %self.task_id, "final snapshot not consumed in time");
                PublishOutcome::Dropped
            }
        }
    }

    fn detach(&mut self) -> PublishOutcome {
        if self.tx.take().is_some() {
            tracing::debug!(task_id = %self.task_id, "progress consumer went away");
        }
        PublishOutcome::Detached
    }
}

impl ProgressReceiver {
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// 读到流结束（终态快照或通道关闭）为止
    pub async fn collect(mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            let end = event.is_end_of_stream();
            events.push(event);
            if end {
                break;
            }
        }
        events
    }

    /// 以 Stream 形式消费，终态事件之后结束
    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> {
        stream::unfold((self, false), |(mut rx, ended)| async move {
            if ended {
                return None;
            }
            let event = rx.recv().await?;
            let ended = event.is_end_of_stream();
            Some((event, (rx, ended)))
        })
    }
}

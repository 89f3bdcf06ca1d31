//! 核心编排层：错误与恢复、任务记录、调度、进度流、任务注册表、主控循环

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod progress;
pub mod recovery;
pub mod registry;
pub mod state;
pub mod step;
pub mod task_scheduler;

pub use builder::{create_llm_from_config, EngineBuilder};
pub use error::EngineError;
pub use orchestrator::{EngineContext, Orchestrator, SubmittedTask};
pub use progress::{
    progress_channel, ProgressEvent, ProgressPublisher, ProgressReceiver, PublishOutcome,
    StepView, TaskSnapshot,
};
pub use recovery::{FailureSite, RecoveryAction, RecoveryEngine};
pub use registry::{
    TaskHandle, TaskRegistry, TaskStatus, TaskSummary, CANCELLED_BY_USER, ENGINE_SHUTDOWN,
};
pub use state::{
    ExecutionMetrics, LogEntry, Phase, Progress, Route, Tally, TaskId, TaskRecord,
};
pub use step::{PlanStep, StepId, StepSpec, StepStatus};
pub use task_scheduler::{next_runnable, schedule, Schedule, FINISH_ACTION};

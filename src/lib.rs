//! Conductor - 多阶段 LLM 代码编辑任务编排引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 任务记录、调度、恢复、进度流、任务注册表与主控循环
//! - **llm**: LLM 客户端抽象、重试层与实现（OpenAI 兼容 / Mock）
//! - **memory**: 对话消息与任务工作记忆
//! - **observability**: 日志初始化
//! - **stages**: 分诊、规划、执行三个阶段
//! - **tools**: 工具箱（检索、外部检索、写文件、代码分析）与执行器

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod stages;
pub mod tools;

pub use crate::core::{EngineBuilder, EngineError, Orchestrator, TaskSnapshot};

//! 引擎构建器：统一的编排器初始化逻辑
//!
//! CLI 与测试共用同一套装配：模型客户端外包重试层，默认注册四个内置工具。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::core::orchestrator::{EngineContext, Orchestrator};
use crate::core::recovery::RecoveryEngine;
use crate::core::registry::TaskRegistry;
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient, RetryingLlmClient};
use crate::tools::{
    AnalyzeCodeTool, CodeHistory, ExternalSearchTool, InternalSearchTool, ToolExecutor,
    ToolRegistry, WriteFileTool,
};

/// 按配置创建模型客户端；provider 为 mock 或缺少密钥时退回 Mock
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let api_key = cfg
        .llm
        .api_key
        .clone()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        .filter(|k| !k.trim().is_empty());

    match (provider.as_str(), api_key) {
        ("mock", _) => {
            tracing::info!("Using Mock LLM");
            Arc::new(MockLlmClient::new())
        }
        (_, Some(key)) => {
            tracing::info!("Using OpenAI-compatible LLM ({})", cfg.llm.model);
            Arc::new(OpenAiClient::new(
                cfg.llm.base_url.as_deref(),
                &cfg.llm.model,
                Some(&key),
                Duration::from_secs(cfg.llm.request_timeout_secs),
            ))
        }
        (_, None) => {
            tracing::warn!("No API key set, using Mock LLM");
            Arc::new(MockLlmClient::new())
        }
    }
}

/// 编排器构建器
pub struct EngineBuilder {
    config: AppConfig,
    workspace: Option<PathBuf>,
    llm: Option<Arc<dyn LlmClient>>,
    tools: Option<ToolRegistry>,
    code_history: Arc<CodeHistory>,
}

impl EngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            workspace: None,
            llm: None,
            tools: None,
            code_history: Arc::new(CodeHistory::new()),
        }
    }

    /// 覆盖配置中的工作区根目录
    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    /// 使用外部提供的模型客户端（仍会外包重试层）
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// 以给定注册表替换默认工具集
    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Some(tools);
        self
    }

    /// 共享写入历史；自定义工具集里的 WriteFileTool 需用同一份才能经编排器查询
    pub fn with_code_history(mut self, history: Arc<CodeHistory>) -> Self {
        self.code_history = history;
        self
    }

    fn workspace(&self) -> PathBuf {
        self.workspace
            .clone()
            .unwrap_or_else(|| self.config.tools.workspace_root())
    }

    /// 默认工具集：内部检索、外部检索、写文件、代码分析
    pub fn build_tool_registry(&self, llm: Arc<dyn LlmClient>) -> ToolRegistry {
        let workspace = self.workspace();
        let mut tools = ToolRegistry::new();
        tools.register(InternalSearchTool::new(
            &workspace,
            self.config.tools.search.clone(),
        ));
        tools.register(ExternalSearchTool::new(&self.config.tools.web_search));
        tools.register(WriteFileTool::with_history(
            &workspace,
            Arc::clone(&self.code_history),
        ));
        tools.register(AnalyzeCodeTool::new(llm));
        tools
    }

    pub fn build(mut self) -> Arc<Orchestrator> {
        let inner = self
            .llm
            .take()
            .unwrap_or_else(|| create_llm_from_config(&self.config));
        let llm: Arc<dyn LlmClient> = Arc::new(RetryingLlmClient::new(
            inner,
            self.config.llm.retry.to_retry_config(),
        ));

        let registry = match self.tools.take() {
            Some(custom) => custom,
            None => self.build_tool_registry(llm.clone()),
        };
        tracing::info!(tools = ?registry.tool_names(), "tool registry ready");
        let config = self.config;

        let executor = ToolExecutor::new(registry, Duration::from_secs(config.tools.tool_timeout_secs));
        let tasks = TaskRegistry::new(
            config.registry.max_tasks,
            Duration::from_secs(config.registry.retention_secs),
            config.engine.log_view,
        );
        let recovery = RecoveryEngine::new(config.engine.non_critical_actions.clone());

        Arc::new(Orchestrator::new(EngineContext {
            registry: Arc::new(tasks),
            tools: Arc::new(executor),
            llm,
            recovery,
            code_history: self.code_history,
            settings: config,
        }))
    }
}

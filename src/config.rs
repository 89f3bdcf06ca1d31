//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CONDUCTOR__*` 覆盖（双下划线表示嵌套，如 `CONDUCTOR__LLM__PROVIDER=mock`）。
//! 所有段与字段都有默认值，缺失的配置不会导致启动失败。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::llm::RetryConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineSection,
    pub llm: LlmSection,
    pub planner: PlannerSection,
    pub progress: ProgressSection,
    pub registry: RegistrySection,
    pub tools: ToolsSection,
}

/// [engine] 段：执行循环上限、日志视图长度、非关键动作
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub max_loops: u32,
    /// 快照中暴露的最近日志条数
    pub log_view: usize,
    /// 失败不终止任务的动作类型（默认为空：任何步骤失败都致命）
    pub non_critical_actions: Vec<String>,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_loops: 25,
            log_view: 20,
            non_critical_actions: Vec::new(),
        }
    }
}

/// [llm] 段：后端选择、超时与重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
    pub retry: LlmRetrySection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key: None,
            request_timeout_secs: 60,
            retry: LlmRetrySection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmRetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for LlmRetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 8000,
        }
    }
}

impl LlmRetrySection {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms)),
        }
    }
}

/// [planner] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlannerSection {
    /// 含首次请求；2 表示至多重问一次
    pub max_attempts: u32,
    pub max_steps: usize,
    /// 拼入规划请求的检索上下文最大字符数
    pub context_chars: usize,
    pub external_max_results: usize,
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            max_steps: 20,
            context_chars: 2000,
            external_max_results: 3,
        }
    }
}

/// [progress] 段：进度通道容量与发送超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProgressSection {
    pub capacity: usize,
    pub send_timeout_ms: u64,
    pub final_timeout_ms: u64,
}

impl Default for ProgressSection {
    fn default() -> Self {
        Self {
            capacity: 32,
            send_timeout_ms: 250,
            final_timeout_ms: 30_000,
        }
    }
}

/// [registry] 段：容量与终态任务保留时长
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    pub max_tasks: usize,
    pub retention_secs: u64,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            max_tasks: 256,
            retention_secs: 3600,
        }
    }
}

/// [tools] 段：工作区根、工具超时、检索后端
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 未设置时为当前目录
    pub workspace_root: Option<PathBuf>,
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    pub search: SearchToolConfig,
    pub web_search: WebSearchConfig,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            workspace_root: None,
            tool_timeout_secs: 30,
            search: SearchToolConfig::default(),
            web_search: WebSearchConfig::default(),
        }
    }
}

impl ToolsSection {
    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// [tools.search] 段：工作区检索
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchToolConfig {
    pub file_extensions: Vec<String>,
    pub max_results: usize,
    /// 超过该大小的文件不读
    pub max_file_bytes: u64,
}

impl Default for SearchToolConfig {
    fn default() -> Self {
        Self {
            file_extensions: ["rs", "py", "js", "jsx", "ts", "tsx", "md", "toml"]
                .into_iter()
                .map(String::from)
                .collect(),
            max_results: 10,
            max_file_bytes: 1024 * 1024,
        }
    }
}

/// [tools.web_search] 段：Tavily 兼容的网页检索端点
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSearchConfig {
    pub endpoint: String,
    /// 未设置时读取 TAVILY_API_KEY
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.tavily.com/search".to_string(),
            api_key: None,
            timeout_secs: 15,
        }
    }
}

/// 从 config 目录加载配置，环境变量 CONDUCTOR__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 CONDUCTOR__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("CONDUCTOR")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

/// 加载失败时退回默认配置
pub fn load_config_or_default(config_path: Option<PathBuf>) -> AppConfig {
    load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        AppConfig::default()
    })
}

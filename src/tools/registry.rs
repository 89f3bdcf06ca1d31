//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / execute），由 ToolRegistry 按名注册与查找，
//! ToolExecutor 在调用时加超时并统一转 EngineError。工具从不 panic，失败一律返回 ToolError。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::core::StepSpec;
use crate::llm::LlmError;

/// 工具调用失败
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Failed(String),

    #[error("path escapes workspace: {0}")]
    PathEscape(String),

    #[error("model call failed: {0}")]
    Model(#[from] LlmError),
}

/// 工具结果：JSON 内容 + 可选的后续步骤（追加到计划末尾）
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ToolOutput {
    pub content: Value,
    pub follow_up: Vec<StepSpec>,
}

impl ToolOutput {
    pub fn new(content: Value) -> Self {
        Self {
            content,
            follow_up: Vec::new(),
        }
    }

    pub fn with_follow_up(mut self, steps: Vec<StepSpec>) -> Self {
        self.follow_up = steps;
        self
    }
}

/// 取必填字符串参数
pub fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ToolError::InvalidArguments(format!("missing '{key}'")))
}

/// 工具 trait：名称、描述、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称，与计划步骤的 action_type 对应
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 可被并发调用；不得持有除只追加历史以外的可变状态
    async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    /// 同名工具后注册者覆盖先注册者
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 生成工具 schema JSON，拼入规划提示词
    pub fn to_schema_json(&self) -> String {
        let mut tools: Vec<(&String, &Arc<dyn Tool>)> = self.tools.iter().collect();
        tools.sort_by(|a, b| a.0.cmp(b.0));
        let tools: Vec<Value> = tools
            .into_iter()
            .map(|(name, tool)| {
                serde_json::json!({
                    "name": name,
                    "description": tool.description(),
                    "parameters": tool.parameters_schema()
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Upper;

    #[async_trait]
    impl Tool for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        fn description(&self) -> &str {
            "Uppercase text"
        }

        async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError> {
            let text = required_str(&args, "text")?;
            Ok(ToolOutput::new(json!(text.to_uppercase())))
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(Upper);
        assert!(registry.contains("upper"));
        assert_eq!(registry.tool_names(), vec!["upper".to_string()]);

        let tool = registry.get("upper").unwrap();
        let out = tool.execute(json!({"text": "abc"})).await.unwrap();
        assert_eq!(out.content, json!("ABC"));
        assert!(registry.to_schema_json().contains("Uppercase text"));
    }

    #[tokio::test]
    async fn test_missing_argument_is_typed_error() {
        let err = Upper.execute(json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}

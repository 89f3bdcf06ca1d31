//! analyze_code 工具：对一段代码按指令做模型分析
//!
//! 模型调用经由带重试的客户端；失败以 ToolError::Model 返回。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::llm::LlmClient;
use crate::memory::Message;
use crate::tools::{required_str, Tool, ToolError, ToolOutput};

const ANALYST_PROMPT: &str = "You are an expert code analyst. Analyze the code according to the \
instruction. Cover structure and patterns, potential improvements, bugs, and concrete suggestions.";

pub struct AnalyzeCodeTool {
    llm: Arc<dyn LlmClient>,
}

impl AnalyzeCodeTool {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Tool for AnalyzeCodeTool {
    fn name(&self) -> &str {
        "analyze_code"
    }

    fn description(&self) -> &str {
        "Ask the model to analyze a piece of code for a given instruction."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": { "type": "string" },
                "instruction": { "type": "string" }
            },
            "required": ["instruction"]
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError> {
        let instruction = required_str(&args, "instruction")?;
        let code = args.get("code").and_then(Value::as_str).unwrap_or("");
        let messages = [
            Message::system(ANALYST_PROMPT),
            Message::user(format!("Instruction: {instruction}\n\nCode:\n```\n{code}\n```")),
        ];
        let analysis = self.llm.complete(&messages).await?;
        Ok(ToolOutput::new(json!({ "analysis": analysis })))
    }
}

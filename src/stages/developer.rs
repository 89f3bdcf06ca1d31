//! 执行阶段：按 action_type 把步骤分派给对应工具，并把结果整理成可折叠进任务记录的产物
//!
//! 未知动作类型是硬错误（UnknownAction），从不静默跳过。工具只调用一次；
//! 模型调用（analyze_code、简单问答）由带重试的客户端负责退避。

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::core::{EngineError, PlanStep, StepSpec, Tally};
use crate::llm::LlmClient;
use crate::stages::prompts::inquiry_messages;
use crate::tools::{hits_from_output, SearchHit, ToolExecutor};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActionType {
    SearchInternal,
    SearchExternal,
    WriteFile,
    AnalyzeCode,
    Finish,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::SearchInternal => "search_internal",
            ActionType::SearchExternal => "search_external",
            ActionType::WriteFile => "write_file",
            ActionType::AnalyzeCode => "analyze_code",
            ActionType::Finish => "finish",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "search_internal" => Ok(ActionType::SearchInternal),
            "search_external" => Ok(ActionType::SearchExternal),
            "write_file" => Ok(ActionType::WriteFile),
            "analyze_code" => Ok(ActionType::AnalyzeCode),
            "finish" => Ok(ActionType::Finish),
            other => Err(EngineError::UnknownAction(other.to_string())),
        }
    }
}

/// 步骤产物
#[derive(Clone, Debug, PartialEq)]
pub enum Artifact {
    SearchHits { query: String, hits: Vec<SearchHit> },
    /// diff 为写入前后内容的统一 diff
    FileWritten { path: String, content: String, diff: String },
    Analysis(String),
    Finished { explanation: String, code: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct StepOutcome {
    pub artifact: Artifact,
    /// 工具要求追加到计划末尾的步骤
    pub follow_up: Vec<StepSpec>,
}

pub struct Developer {
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolExecutor>,
}

fn param_str(params: &Map<String, Value>, key: &str) -> Option<String> {
    params.get(key).and_then(Value::as_str).map(String::from)
}

impl Developer {
    pub fn new(llm: Arc<dyn LlmClient>, tools: Arc<ToolExecutor>) -> Self {
        Self { llm, tools }
    }

    /// 执行单个步骤；current_code 为任务当前的工作代码
    pub async fn execute(
        &self,
        step: &PlanStep,
        current_code: &str,
        tally: &mut Tally,
    ) -> Result<StepOutcome, EngineError> {
        let action: ActionType = step.action_type.parse()?;
        let mut args = step.parameters.clone();

        if action == ActionType::Finish {
            return Ok(StepOutcome {
                artifact: Artifact::Finished {
                    explanation: param_str(&args, "final_explanation")
                        .unwrap_or_else(|| step.description.clone()),
                    code: param_str(&args, "final_code").unwrap_or_else(|| current_code.to_string()),
                },
                follow_up: Vec::new(),
            });
        }

        match action {
            ActionType::SearchInternal | ActionType::SearchExternal => {
                args.entry("query")
                    .or_insert_with(|| Value::String(step.description.clone()));
            }
            ActionType::AnalyzeCode => {
                args.entry("code")
                    .or_insert_with(|| Value::String(current_code.to_string()));
                args.entry("instruction")
                    .or_insert_with(|| Value::String(step.description.clone()));
            }
            ActionType::WriteFile | ActionType::Finish => {}
        }

        let output = self
            .tools
            .execute(action.as_str(), Value::Object(args.clone()))
            .await
            .map_err(|e| match e {
                EngineError::UnknownAction(_) => e,
                other => EngineError::StepExecutionFailure {
                    step_id: step.id.clone(),
                    reason: other.to_string(),
                },
            })?;

        let artifact = match action {
            ActionType::SearchInternal | ActionType::SearchExternal => {
                if action == ActionType::SearchInternal {
                    tally.internal_searches += 1;
                } else {
                    tally.external_searches += 1;
                }
                Artifact::SearchHits {
                    query: param_str(&args, "query").unwrap_or_default(),
                    hits: hits_from_output(&output.content),
                }
            }
            ActionType::WriteFile => {
                tally.files_modified += 1;
                Artifact::FileWritten {
                    path: param_str(&args, "path").unwrap_or_default(),
                    content: param_str(&args, "content").unwrap_or_default(),
                    diff: output
                        .content
                        .get("diff")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                }
            }
            ActionType::AnalyzeCode => {
                tally.llm_calls += 1;
                Artifact::Analysis(
                    output
                        .content
                        .get("analysis")
                        .and_then(Value::as_str)
                        .map(String::from)
                        .unwrap_or_else(|| output.content.to_string()),
                )
            }
            ActionType::Finish => Artifact::Finished {
                explanation: step.description.clone(),
                code: current_code.to_string(),
            },
        };

        Ok(StepOutcome {
            artifact,
            follow_up: output.follow_up,
        })
    }

    /// 简单问答：不经规划直接请求模型作答
    pub async fn answer_inquiry(
        &self,
        instruction: &str,
        code: &str,
        tally: &mut Tally,
    ) -> Result<String, EngineError> {
        tally.llm_calls += 1;
        Ok(self.llm.complete(&inquiry_messages(instruction, code)).await?)
    }
}

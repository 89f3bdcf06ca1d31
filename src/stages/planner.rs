//! 规划阶段：收集检索上下文 → 请求模型给出完整计划 → 结构校验
//!
//! - 内部检索与外部检索并发执行（整个任务唯一的扇出点），任一失败都只记警告
//! - 计划必须整体合法，不接受部分计划；结构错误时以相同输入至多重问一次
//! - 合法计划的最后一步必须是 finish，并携带 final_explanation 与 final_code

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;

use crate::config::PlannerSection;
use crate::core::{
    EngineError, FailureSite, RecoveryAction, RecoveryEngine, StepSpec, Tally, FINISH_ACTION,
};
use crate::llm::LlmClient;
use crate::stages::parse::parse_payload;
use crate::stages::prompts::{plan_messages, PlanPayload};
use crate::tools::{hits_from_output, SearchHit, ToolExecutor};

/// 摘要中保留的检索结果条数
const SUMMARY_HITS: usize = 5;
/// 每条结果保留的字符数
const SUMMARY_CHARS_PER_HIT: usize = 200;

/// 规划上下文：检索命中及其截断后的摘要
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlanContext {
    pub query: String,
    pub hits: Vec<SearchHit>,
    pub summary: String,
}

/// 把命中整理成拼入提示词的摘要，总长不超过 max_chars
pub fn summarize_hits(hits: &[SearchHit], max_chars: usize) -> String {
    if hits.is_empty() {
        return "No relevant search results found.".to_string();
    }
    let mut summary = String::from("Relevant information found:\n");
    for (i, hit) in hits.iter().take(SUMMARY_HITS).enumerate() {
        let content: String = hit.content.chars().take(SUMMARY_CHARS_PER_HIT).collect();
        summary.push_str(&format!("{}. {} ({})\n   {content}...\n\n", i + 1, hit.title, hit.source));
    }
    if summary.chars().count() > max_chars {
        summary = summary.chars().take(max_chars).collect();
    }
    summary
}

/// 计划结构校验：非空、不超过 max_steps、id 非空且唯一、动作类型非空、
/// 依赖只能指向更早的步骤、finish 只能且必须出现在最后并携带最终结果
pub fn validate_plan(steps: &[StepSpec], max_steps: usize) -> Result<(), EngineError> {
    let invalid = |msg: String| Err(EngineError::InvalidPlan(msg));
    if steps.is_empty() {
        return invalid("plan has no steps".to_string());
    }
    if steps.len() > max_steps {
        return invalid(format!("plan has {} steps (max {max_steps})", steps.len()));
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for (i, step) in steps.iter().enumerate() {
        if step.id.trim().is_empty() {
            return invalid(format!("step #{} has an empty id", i + 1));
        }
        if step.action_type.trim().is_empty() {
            return invalid(format!("step '{}' has no action_type", step.id));
        }
        if let Some(dep) = step.dependencies.iter().find(|d| !seen.contains(d.as_str())) {
            return invalid(format!(
                "step '{}' depends on '{dep}', which is not an earlier step",
                step.id
            ));
        }
        if !seen.insert(step.id.as_str()) {
            return invalid(format!("duplicate step id '{}'", step.id));
        }
        let is_last = i + 1 == steps.len();
        if step.action_type == FINISH_ACTION && !is_last {
            return invalid(format!("finish step '{}' is not the last step", step.id));
        }
    }

    let last = &steps[steps.len() - 1];
    if last.action_type != FINISH_ACTION {
        return invalid("the last step must be a finish step".to_string());
    }
    for key in ["final_explanation", "final_code"] {
        if !last.parameters.get(key).is_some_and(|v| v.is_string()) {
            return invalid(format!("finish step is missing '{key}'"));
        }
    }
    Ok(())
}

pub struct Planner {
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolExecutor>,
    recovery: RecoveryEngine,
    settings: PlannerSection,
}

impl Planner {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolExecutor>,
        recovery: RecoveryEngine,
        settings: PlannerSection,
    ) -> Self {
        Self {
            llm,
            tools,
            recovery,
            settings,
        }
    }

    /// 并发执行内部 / 外部检索；失败的一路按空结果处理
    pub async fn gather_context(&self, instruction: &str, tally: &mut Tally) -> PlanContext {
        let internal = self
            .tools
            .execute("search_internal", json!({ "query": instruction }));
        let external = self.tools.execute(
            "search_external",
            json!({ "query": instruction, "max_results": self.settings.external_max_results }),
        );
        let (internal, external) = tokio::join!(internal, external);

        let mut hits = Vec::new();
        for (name, result) in [("search_internal", internal), ("search_external", external)] {
            match result {
                Ok(output) => {
                    if name == "search_internal" {
                        tally.internal_searches += 1;
                    } else {
                        tally.external_searches += 1;
                    }
                    hits.extend(hits_from_output(&output.content));
                }
                Err(e) => tracing::warn!(tool = name, error = %e, "context search failed"),
            }
        }
        PlanContext {
            query: instruction.to_string(),
            summary: summarize_hits(&hits, self.settings.context_chars),
            hits,
        }
    }

    async fn request_plan(
        &self,
        instruction: &str,
        code: &str,
        context: &PlanContext,
    ) -> Result<Vec<StepSpec>, EngineError> {
        let messages = plan_messages(instruction, code, &context.summary, &self.tools.schema_json());
        let output = self.llm.complete(&messages).await?;
        let payload: PlanPayload = parse_payload(&output)?;
        validate_plan(&payload.steps, self.settings.max_steps)?;
        Ok(payload.steps)
    }

    /// 生成完整计划；结构错误时以相同输入至多再请求 max_attempts - 1 次
    pub async fn generate_plan(
        &self,
        instruction: &str,
        code: &str,
        context: &PlanContext,
        tally: &mut Tally,
    ) -> Result<Vec<StepSpec>, EngineError> {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            tally.llm_calls += 1;
            let err = match self.request_plan(instruction, code, context).await {
                Ok(steps) => {
                    tracing::info!(steps = steps.len(), attempt, "plan accepted");
                    return Ok(steps);
                }
                Err(e) => e,
            };
            match self.recovery.handle(&err, FailureSite::Planning { attempt, max_attempts }) {
                RecoveryAction::Reask => {
                    tracing::warn!(attempt, error = %err, "plan rejected, asking again");
                    attempt += 1;
                }
                RecoveryAction::Continue | RecoveryAction::Abort(_) => {
                    return Err(match err {
                        EngineError::PlanGenerationFailure(_) => err,
                        other => EngineError::PlanGenerationFailure(other.to_string()),
                    });
                }
            }
        }
    }
}

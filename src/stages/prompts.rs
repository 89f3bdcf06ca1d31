//! 各阶段的提示词构造
//!
//! 规划提示词中注入由 schemars 生成的 PlanPayload JSON Schema，减少模型输出格式错误。

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};

use crate::core::StepSpec;
use crate::memory::Message;

/// 分诊时附带的代码片段长度
pub const TRIAGE_CODE_CHARS: usize = 500;
/// 规划时附带的代码长度
pub const PLAN_CODE_CHARS: usize = 1000;

/// 规划阶段要求模型输出的结构
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PlanPayload {
    /// 按执行顺序排列的原子步骤，最后一步必须是 finish
    pub steps: Vec<StepSpec>,
}

pub fn plan_schema_json() -> String {
    let schema = schema_for!(PlanPayload);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

fn head(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        out.push_str("...");
    }
    out
}

const TRIAGE_PROMPT: &str = r#"You are the triage agent of an AI code editor. Classify the user's request into one execution route and estimate its complexity.

Routes:
- simple_inquiry: questions, explanations, or tiny self-contained snippets that need no file context
- code_generation: generate new files or larger code from a description without modifying existing files
- simple_modification: small changes to the provided code (bug fix, small feature, small refactor)
- complex_modification: significant changes, multiple files, or complex logic in the existing codebase
- research_and_implement: needs external research (libraries, APIs) before implementing

Complexity is an integer from 1 (very simple) to 10 (very complex).

Reply with exactly one JSON object and nothing else:
{"route": "<route>", "complexity": <1-10>}"#;

pub fn triage_messages(instruction: &str, code: &str) -> Vec<Message> {
    let snippet = if code.trim().is_empty() {
        "No code provided.".to_string()
    } else {
        code.chars().take(TRIAGE_CODE_CHARS).collect::<String>().trim().to_string()
    };
    vec![
        Message::system(TRIAGE_PROMPT),
        Message::user(format!(
            "User instruction:\n\"{instruction}\"\n\nProvided code (first {TRIAGE_CODE_CHARS} chars):\n```\n{snippet}\n```"
        )),
    ]
}

pub fn plan_messages(
    instruction: &str,
    code: &str,
    context: &str,
    tools_schema: &str,
) -> Vec<Message> {
    let system = format!(
        "You are an expert software development planner. Break the user's instruction into small, \
atomic steps that a developer agent can execute one at a time.\n\n\
Available actions (action_type) and their parameters:\n{tools_schema}\n\
- finish: parameters {{\"final_explanation\": string, \"final_code\": string}}\n\n\
Rules:\n\
1. Every step has a unique id.\n\
2. dependencies may only name ids of steps that appear earlier in the list.\n\
3. The last step must be a finish step carrying the final explanation and the final code.\n\n\
Reply with a single JSON object matching this schema:\n{}",
        plan_schema_json()
    );
    let context = if context.trim().is_empty() {
        "No search results."
    } else {
        context
    };
    vec![
        Message::system(system),
        Message::user(format!(
            "User instruction: {instruction}\n\nCurrent code:\n```\n{}\n```\n\nSearch results context:\n{context}",
            head(code, PLAN_CODE_CHARS)
        )),
    ]
}

pub fn inquiry_messages(instruction: &str, code: &str) -> Vec<Message> {
    let mut user = format!("Question: {instruction}");
    if !code.trim().is_empty() {
        user.push_str(&format!("\n\nCode:\n```\n{code}\n```"));
    }
    vec![
        Message::system(
            "You are a senior software engineer. Answer the question clearly and concisely. \
Include short code snippets only when they help.",
        ),
        Message::user(user),
    ]
}

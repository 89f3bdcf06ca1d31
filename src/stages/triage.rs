//! 分诊阶段：把请求映射为路线与复杂度
//!
//! 模型调用失败或输出不合法时一律回退到 complex_modification / 复杂度 8：
//! 宁可走最完整的流程，也不因误判而跳过工作。

use std::sync::Arc;

use serde::Deserialize;

use crate::core::{EngineError, Route};
use crate::llm::LlmClient;
use crate::stages::parse::parse_payload;
use crate::stages::prompts::triage_messages;

pub const FALLBACK_ROUTE: Route = Route::ComplexModification;
pub const FALLBACK_COMPLEXITY: u8 = 8;

#[derive(Debug, Deserialize)]
struct TriagePayload {
    route: String,
    complexity: i64,
}

/// 分诊结论；fallback_reason 非空表示走了回退
#[derive(Clone, Debug, PartialEq)]
pub struct Assessment {
    pub route: Route,
    pub complexity: u8,
    pub fallback_reason: Option<String>,
}

impl Assessment {
    pub fn fallback(err: &EngineError) -> Self {
        Self {
            route: FALLBACK_ROUTE,
            complexity: FALLBACK_COMPLEXITY,
            fallback_reason: Some(err.to_string()),
        }
    }
}

pub struct Classifier {
    llm: Arc<dyn LlmClient>,
}

impl Classifier {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// 从不失败：任何错误都吸收为回退路线
    pub async fn classify(&self, instruction: &str, code: &str) -> Assessment {
        match self.try_classify(instruction, code).await {
            Ok(assessment) => assessment,
            Err(err) => {
                tracing::warn!(error = %err, "triage failed, falling back to {}", FALLBACK_ROUTE);
                Assessment::fallback(&err)
            }
        }
    }

    async fn try_classify(&self, instruction: &str, code: &str) -> Result<Assessment, EngineError> {
        let output = self
            .llm
            .complete(&triage_messages(instruction, code))
            .await
            .map_err(|e| EngineError::ClassificationFailure(e.to_string()))?;
        let payload: TriagePayload = parse_payload(&output)?;
        let route: Route = payload.route.parse()?;
        let complexity = u8::try_from(payload.complexity)
            .ok()
            .filter(|c| (1..=10).contains(c))
            .ok_or_else(|| {
                EngineError::ParseFailure(format!("complexity {} out of range 1..=10", payload.complexity))
            })?;
        Ok(Assessment {
            route,
            complexity,
            fallback_reason: None,
        })
    }
}

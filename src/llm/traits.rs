//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient::complete（非流式）。
//! RetryingLlmClient 为任意后端套上有界重试 + 指数退避：模型调用是最容易出现瞬时故障的依赖，
//! 其余工具（检索、写文件）只尝试一次。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::memory::Message;

/// 模型调用失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("API error: {0}")]
    Api(String),

    #[error("request timed out")]
    Timeout,

    #[error("rate limited (retry after {retry_after_ms}ms)")]
    RateLimited { retry_after_ms: u64 },

    #[error("empty response")]
    EmptyResponse,

    /// 请求本身不合法（4xx 等），重试无意义
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LlmError::InvalidRequest(_))
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    fn model_name(&self) -> &str {
        "unknown"
    }
}

/// 重试策略：固定次数，延迟从 base_delay 起逐次翻倍，上限 max_delay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// 总尝试次数（含第一次）
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryConfig {
    /// 第 attempt 次失败后（从 0 计）应等待的时长
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// 为内部客户端加有界重试与指数退避
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let err = match self.inner.complete(messages).await {
                Ok(text) if !text.trim().is_empty() => return Ok(text),
                Ok(_) => LlmError::EmptyResponse,
                Err(e) => e,
            };
            if !err.is_retryable() || attempt + 1 >= attempts {
                return Err(err);
            }

            let mut delay = self.config.delay_for(attempt);
            if let LlmError::RateLimited { retry_after_ms } = &err {
                delay = delay
                    .max(Duration::from_millis(*retry_after_ms))
                    .min(self.config.max_delay);
            }
            attempt += 1;
            tracing::warn!(
                attempt,
                max_attempts = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "LLM call failed, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

//! Mock LLM 客户端（用于测试与离线运行，无需 API）
//!
//! 脚本模式：按顺序弹出预置的回复（成功或失败）；脚本耗尽后走离线回退：
//! 分诊请求一律判为 simple_inquiry，其余回显最后一条 User 消息。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError};
use crate::memory::{last_user_content, Message, Role};

#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    /// 只追加的调用历史（每次调用的完整消息）
    history: Mutex<Vec<Vec<Message>>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(replies: Vec<Result<String, LlmError>>) -> Self {
        Self {
            script: Mutex::new(replies.into()),
            history: Mutex::new(Vec::new()),
        }
    }

    /// 追加一条脚本回复
    pub fn push_reply(&self, reply: Result<String, LlmError>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(reply);
        }
    }

    pub fn call_count(&self) -> usize {
        self.history.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    fn offline_reply(messages: &[Message]) -> String {
        let is_triage = messages
            .iter()
            .any(|m| m.role == Role::System && m.content.contains("\"route\""));
        if is_triage {
            return r#"{"route": "simple_inquiry", "complexity": 1}"#.to_string();
        }
        format!(
            "Echo from Mock: {}",
            last_user_content(messages).unwrap_or("(no input)")
        )
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        if let Ok(mut history) = self.history.lock() {
            history.push(messages.to_vec());
        }
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match scripted {
            Some(reply) => reply,
            None => Ok(Self::offline_reply(messages)),
        }
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

//! search_external 工具：调用 Tavily 兼容的网页检索端点
//!
//! POST {api_key, query, max_results}，响应中的 results[].{title, url, content, score} 转成 SearchHit。
//! 只请求一次，失败直接返回给调用方。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::WebSearchConfig;
use crate::tools::search::SearchHit;
use crate::tools::{required_str, Tool, ToolError, ToolOutput};

/// 单条结果的内容上限（字符）
const MAX_CONTENT_CHARS: usize = 1000;

#[derive(Debug, Deserialize)]
struct WebResponse {
    #[serde(default)]
    results: Vec<WebResult>,
}

#[derive(Debug, Deserialize)]
struct WebResult {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    content: String,
    #[serde(default)]
    score: Option<f64>,
}

pub struct ExternalSearchTool {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl ExternalSearchTool {
    pub fn new(config: &WebSearchConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent("conductor/0.1")
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config
                .api_key
                .clone()
                .or_else(|| std::env::var("TAVILY_API_KEY").ok()),
        }
    }
}

fn to_hits(response: WebResponse) -> Vec<SearchHit> {
    response
        .results
        .into_iter()
        .map(|r| SearchHit {
            title: r.title.unwrap_or_else(|| "No title".to_string()),
            content: r.content.chars().take(MAX_CONTENT_CHARS).collect(),
            url: r.url,
            relevance_score: r.score.unwrap_or(0.5),
            source: "external".to_string(),
        })
        .collect()
}

#[async_trait]
impl Tool for ExternalSearchTool {
    fn name(&self) -> &str {
        "search_external"
    }

    fn description(&self) -> &str {
        "Search the web for documentation and examples."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "max_results": { "type": "integer", "minimum": 1 }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError> {
        let query = required_str(&args, "query")?;
        let max_results = args
            .get("max_results")
            .and_then(Value::as_u64)
            .unwrap_or(5)
            .max(1);
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ToolError::Failed("web search API key is not configured".to_string()))?;

        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({
                "api_key": api_key,
                "query": query,
                "max_results": max_results,
                "search_depth": "advanced",
            }))
            .send()
            .await
            .map_err(|e| ToolError::Failed(format!("web search request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::Failed(format!("web search returned HTTP {status}")));
        }
        let body: WebResponse = response
            .json()
            .await
            .map_err(|e| ToolError::Failed(format!("invalid web search response: {e}")))?;

        let mut hits = to_hits(body);
        hits.truncate(max_results as usize);
        tracing::info!(query = %query, hits = hits.len(), "external search");
        Ok(ToolOutput::new(json!({ "query": query, "results": hits })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_mapping() {
        let body: WebResponse = serde_json::from_value(json!({
            "results": [
                {"title": "Tokio docs", "url": "https://docs.rs/tokio", "content": "x".repeat(1500), "score": 0.9},
                {"content": "untitled"}
            ]
        }))
        .unwrap();
        let hits = to_hits(body);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].content.len(), MAX_CONTENT_CHARS);
        assert_eq!(hits[0].relevance_score, 0.9);
        assert_eq!(hits[1].title, "No title");
        assert_eq!(hits[1].relevance_score, 0.5);
        assert_eq!(hits[1].source, "external");
    }

    #[tokio::test]
    async fn test_missing_api_key_is_typed_failure() {
        let tool = ExternalSearchTool {
            client: Client::new(),
            endpoint: "http://127.0.0.1:9/search".to_string(),
            api_key: None,
        };
        let err = tool.execute(json!({"query": "tokio select"})).await.unwrap_err();
        assert!(matches!(err, ToolError::Failed(_)));
    }
}

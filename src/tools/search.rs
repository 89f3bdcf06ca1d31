//! search_internal 工具：在工作区内按关键词检索代码
//!
//! 遍历工作区（跳过隐藏目录与 target/），只看配置中的扩展名；文件需包含全部关键词（不区分大小写）。
//! 相关度 = min(命中次数 / 10, 1.0)，片段取首个命中行上下各 2 行，按相关度降序返回前 max_results 条。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use walkdir::{DirEntry, WalkDir};

use crate::config::SearchToolConfig;
use crate::tools::{required_str, Tool, ToolError, ToolOutput};

/// 一条检索结果（内部 / 外部共用）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub url: Option<String>,
    pub relevance_score: f64,
    /// internal / external
    pub source: String,
}

/// 从工具输出中取出命中列表
pub fn hits_from_output(content: &Value) -> Vec<SearchHit> {
    content
        .get("results")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

pub struct InternalSearchTool {
    root: PathBuf,
    config: SearchToolConfig,
}

impl InternalSearchTool {
    pub fn new(workspace_root: impl AsRef<Path>, config: SearchToolConfig) -> Self {
        Self {
            root: workspace_root.as_ref().to_path_buf(),
            config,
        }
    }
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    if entry.depth() == 0 || !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || name == "target" || name == "node_modules"
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    extensions
        .iter()
        .any(|want| want.trim_start_matches('.').eq_ignore_ascii_case(ext))
}

/// 单个文件的匹配：全部关键词出现才算命中
fn match_file(content: &str, keywords: &[String]) -> Option<(usize, String)> {
    let lower = content.to_lowercase();
    if !keywords.iter().all(|k| lower.contains(k.as_str())) {
        return None;
    }
    let count: usize = keywords.iter().map(|k| lower.matches(k.as_str()).count()).sum();

    let lines: Vec<&str> = content.lines().collect();
    let first = &keywords[0];
    let snippet = lines
        .iter()
        .position(|l| l.to_lowercase().contains(first.as_str()))
        .map(|i| {
            let start = i.saturating_sub(2);
            let end = (i + 3).min(lines.len());
            lines[start..end].join("\n")
        })
        .unwrap_or_default();
    Some((count, snippet))
}

fn search_workspace(root: &Path, query: &str, config: &SearchToolConfig) -> Vec<SearchHit> {
    let keywords: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
    if keywords.is_empty() {
        return Vec::new();
    }

    let mut hits = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !is_skipped_dir(e));
    for entry in walker.filter_map(Result::ok) {
        let path = entry.path();
        if !entry.file_type().is_file() || !has_extension(path, &config.file_extensions) {
            continue;
        }
        if entry.metadata().map(|m| m.len() > config.max_file_bytes).unwrap_or(true) {
            continue;
        }
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable file");
                continue;
            }
        };
        if let Some((count, snippet)) = match_file(&content, &keywords) {
            let relative = path.strip_prefix(root).unwrap_or(path);
            hits.push(SearchHit {
                title: format!("Code in {}", relative.display()),
                content: snippet,
                url: Some(relative.display().to_string()),
                relevance_score: (count as f64 / 10.0).min(1.0),
                source: "internal".to_string(),
            });
        }
    }

    hits.sort_by(|a, b| {
        b.relevance_score
            .total_cmp(&a.relevance_score)
            .then_with(|| a.title.cmp(&b.title))
    });
    hits.truncate(config.max_results);
    hits
}

#[async_trait]
impl Tool for InternalSearchTool {
    fn name(&self) -> &str {
        "search_internal"
    }

    fn description(&self) -> &str {
        "Search the workspace source files for a keyword query."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "keywords to look for" }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError> {
        let query = required_str(&args, "query")?.to_string();
        let root = self.root.clone();
        let config = self.config.clone();
        let q = query.clone();
        let hits = tokio::task::spawn_blocking(move || search_workspace(&root, &q, &config))
            .await
            .map_err(|e| ToolError::Failed(format!("search task failed: {e}")))?;
        tracing::info!(query = %query, hits = hits.len(), "internal search");
        Ok(ToolOutput::new(json!({ "query": query, "results": hits })))
    }
}

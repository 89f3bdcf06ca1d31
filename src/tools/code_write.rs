//! write_file 工具：在工作区内写入（覆盖）文件
//!
//! 参数 path / content / description；返回写入路径、字节数与统一 diff，编排器据此更新 current_code。
//! 每次写入前先读出旧内容，变更追加到共享的 [`CodeHistory`]（只追加，不回写）。

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use similar::TextDiff;

use crate::tools::filesystem::SafeFs;
use crate::tools::{required_str, Tool, ToolError, ToolOutput};

/// 一次文件写入
#[derive(Debug, Clone, Serialize)]
pub struct CodeChange {
    pub path: String,
    /// 新建文件时为空串
    pub original_content: String,
    pub modified_content: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

impl CodeChange {
    pub fn diff(&self) -> String {
        unified_diff(&self.original_content, &self.modified_content, &self.path)
    }
}

/// 写入历史，按发生顺序追加
#[derive(Debug, Default)]
pub struct CodeHistory {
    changes: Mutex<Vec<CodeChange>>,
}

impl CodeHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, change: CodeChange) {
        let mut changes = self.changes.lock().unwrap_or_else(|e| e.into_inner());
        changes.push(change);
    }

    pub fn len(&self) -> usize {
        self.changes.lock().map(|c| c.len()).unwrap_or_else(|e| e.into_inner().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 最近 limit 条变更（新的在前），每条带 path / description / timestamp / diff
    pub fn recent(&self, limit: usize) -> Vec<Value> {
        let changes = self.changes.lock().unwrap_or_else(|e| e.into_inner());
        changes
            .iter()
            .rev()
            .take(limit)
            .map(|c| {
                json!({
                    "path": c.path,
                    "description": c.description,
                    "timestamp": c.timestamp.to_rfc3339(),
                    "diff": c.diff(),
                })
            })
            .collect()
    }
}

/// original -> modified 的统一 diff，文件头为 a/<path> 与 b/<path>
pub fn unified_diff(original: &str, modified: &str, path: &str) -> String {
    TextDiff::from_lines(original, modified)
        .unified_diff()
        .header(&format!("a/{path}"), &format!("b/{path}"))
        .to_string()
}

pub struct WriteFileTool {
    fs: SafeFs,
    max_file_size: usize,
    history: Arc<CodeHistory>,
}

impl WriteFileTool {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self::with_history(workspace_root, Arc::new(CodeHistory::new()))
    }

    /// 与其他组件共享同一份写入历史
    pub fn with_history(workspace_root: impl AsRef<Path>, history: Arc<CodeHistory>) -> Self {
        Self {
            fs: SafeFs::new(workspace_root),
            max_file_size: 10 * 1024 * 1024, // 10MB
            history,
        }
    }

    pub fn history(&self) -> Arc<CodeHistory> {
        Arc::clone(&self.history)
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write (overwrite) a file inside the workspace. Parent directories are created. Returns a unified diff."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "path relative to the workspace root" },
                "content": { "type": "string", "description": "full new file content" },
                "description": { "type": "string", "description": "what the change does" }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError> {
        let path = required_str(&args, "path")?;
        let content = args
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments("missing 'content'".to_string()))?;
        if content.len() > self.max_file_size {
            return Err(ToolError::InvalidArguments(format!(
                "content too large: {} bytes (max {})",
                content.len(),
                self.max_file_size
            )));
        }
        let description = args.get("description").and_then(Value::as_str).unwrap_or("");

        let previous = self.fs.read_existing(path).await?;
        let created = previous.is_none();
        let written = self.fs.write(path, content).await?;

        let change = CodeChange {
            path: path.to_string(),
            original_content: previous.unwrap_or_default(),
            modified_content: content.to_string(),
            description: description.to_string(),
            timestamp: Utc::now(),
        };
        let diff = change.diff();
        self.history.record(change);

        tracing::info!(path = %written.display(), bytes = content.len(), created, "file written");
        Ok(ToolOutput::new(json!({
            "path": path,
            "bytes": content.len(),
            "description": description,
            "content": content,
            "created": created,
            "diff": diff,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_inside_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let tool = WriteFileTool::new(dir.path());
        let out = tool
            .execute(json!({"path": "src/new.rs", "content": "fn x() {}", "description": "add x"}))
            .await
            .unwrap();
        assert_eq!(out.content["bytes"], 9);
        assert_eq!(out.content["created"], true);
        let on_disk = std::fs::read_to_string(dir.path().join("src/new.rs")).unwrap();
        assert_eq!(on_disk, "fn x() {}");
    }

    #[tokio::test]
    async fn test_overwrite_records_original_and_diff() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lib.rs"), "fn old() {}\nfn keep() {}\n").unwrap();
        let tool = WriteFileTool::new(dir.path());

        let out = tool
            .execute(json!({
                "path": "lib.rs",
                "content": "fn new() {}\nfn keep() {}\n",
                "description": "rename old"
            }))
            .await
            .unwrap();

        assert_eq!(out.content["created"], false);
        let diff = out.content["diff"].as_str().unwrap();
        assert!(diff.contains("--- a/lib.rs"));
        assert!(diff.contains("+++ b/lib.rs"));
        assert!(diff.contains("-fn old() {}"));
        assert!(diff.contains("+fn new() {}"));
        assert!(!diff.contains("-fn keep() {}"));

        let history = tool.history();
        assert_eq!(history.len(), 1);
        let recent = history.recent(10);
        assert_eq!(recent[0]["path"], "lib.rs");
        assert_eq!(recent[0]["description"], "rename old");
        assert_eq!(recent[0]["diff"], diff);
    }

    #[tokio::test]
    async fn test_history_is_newest_first_and_limited() {
        let dir = tempfile::tempdir().unwrap();
        let history = Arc::new(CodeHistory::new());
        let tool = WriteFileTool::with_history(dir.path(), Arc::clone(&history));

        for (i, body) in ["a\n", "b\n", "c\n"].iter().enumerate() {
            tool.execute(json!({"path": "f.txt", "content": body, "description": format!("v{i}")}))
                .await
                .unwrap();
        }

        assert_eq!(history.len(), 3);
        let recent = history.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0]["description"], "v2");
        assert_eq!(recent[1]["description"], "v1");
        assert!(recent[0]["diff"].as_str().unwrap().contains("-b"));
        assert!(recent[0]["diff"].as_str().unwrap().contains("+c"));
    }

    #[tokio::test]
    async fn test_rejected_write_leaves_history_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let tool = WriteFileTool::new(dir.path());
        let err = tool
            .execute(json!({"path": "../escape.rs", "content": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::PathEscape(_)));
        assert!(tool.history().is_empty());
    }

    #[tokio::test]
    async fn test_empty_content_is_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let tool = WriteFileTool::new(dir.path());
        tool.execute(json!({"path": "empty.txt", "content": ""})).await.unwrap();
        assert!(dir.path().join("empty.txt").exists());
    }

    #[test]
    fn test_unified_diff_of_new_file_is_all_additions() {
        let diff = unified_diff("", "one\ntwo\n", "n.txt");
        assert!(diff.contains("+one"));
        assert!(diff.contains("+two"));
        assert!(!diff.lines().any(|l| l.starts_with('-') && !l.starts_with("---")));
    }
}

//! 沙箱文件系统
//!
//! SafeFs 绑定工作区根目录，所有路径经 resolve 校验必须落在根下：
//! 拒绝绝对路径与 `..` 分量，已存在的目标再做一次 canonicalize 检查（防符号链接逃逸）。

use std::path::{Component, Path, PathBuf};

use crate::tools::ToolError;

#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 相对路径 -> 根下绝对路径
    pub fn resolve(&self, path: &str) -> Result<PathBuf, ToolError> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return Err(ToolError::InvalidArguments("empty path".to_string()));
        }
        let relative = Path::new(trimmed);
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(ToolError::PathEscape(trimmed.to_string())); // 如 ../../etc/passwd
                }
            }
        }
        let full = self.root_dir.join(relative);
        if let Ok(canonical) = full.canonicalize() {
            if !canonical.starts_with(&self.root_dir) {
                return Err(ToolError::PathEscape(trimmed.to_string()));
            }
        }
        Ok(full)
    }

    /// 读取已存在的文件；不存在时返回 None
    pub async fn read_existing(&self, path: &str) -> Result<Option<String>, ToolError> {
        let resolved = self.resolve(path)?;
        match tokio::fs::read_to_string(&resolved).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ToolError::Failed(format!("Read failed: {e}"))),
        }
    }

    /// 写入文件（自动创建父目录），返回写入的绝对路径
    pub async fn write(&self, path: &str, content: &str) -> Result<PathBuf, ToolError> {
        let resolved = self.resolve(path)?;
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::Failed(format!("Failed to create parent directory: {e}")))?;
        }
        tokio::fs::write(&resolved, content)
            .await
            .map_err(|e| ToolError::Failed(format!("Write failed: {e}")))?;
        Ok(resolved)
    }
}

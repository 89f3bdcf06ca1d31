//! 模型输出解析：视为不可信载荷，提取 JSON 后按强类型结构反序列化
//!
//! 支持 ```json ... ``` 代码块、普通 ``` 代码块、或首个 `{` 到最后一个 `}`；不合法一律 ParseFailure。

use serde::de::DeserializeOwned;

use crate::core::EngineError;

/// 从模型输出中截取 JSON 片段
pub fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    if let Some(start) = trimmed.find("```") {
        let rest = &trimmed[start + 3..];
        if let Some(end) = rest.find("```") {
            let body = rest[..end].trim();
            if body.starts_with('{') {
                return Some(body);
            }
        }
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

pub fn parse_payload<T: DeserializeOwned>(output: &str) -> Result<T, EngineError> {
    let json = extract_json(output).ok_or_else(|| {
        EngineError::ParseFailure(format!("no JSON object in model output: {}", preview(output)))
    })?;
    serde_json::from_str(json)
        .map_err(|e| EngineError::ParseFailure(format!("{e}: {}", preview(json))))
}

fn preview(s: &str) -> String {
    let s = s.trim();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s.to_string()
    }
}

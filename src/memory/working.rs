//! 任务级工作记忆：阶段之间传递中间结果（检索命中、分析结论、推理过程）
//!
//! 仅在所属任务内可见；键为字符串，值为任意 JSON。检索缓存统一放在 `search_cache` 下，按查询分组。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 检索缓存所在的键
pub const SEARCH_CACHE_KEY: &str = "search_cache";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkingMemory {
    entries: BTreeMap<String, Value>,
}

impl WorkingMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// 以 query 为键写入 `search_cache`；同一查询再次写入时覆盖
    pub fn cache_search_results(&mut self, query: &str, results: Value) {
        let cache = self
            .entries
            .entry(SEARCH_CACHE_KEY.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        if !cache.is_object() {
            *cache = Value::Object(Default::default());
        }
        if let Value::Object(map) = cache {
            map.insert(query.to_string(), results);
        }
    }

    pub fn cached_search(&self, query: &str) -> Option<&Value> {
        self.entries.get(SEARCH_CACHE_KEY)?.get(query)
    }
}

//! 外部协作方接口
//!
//! 关键词目录、条目存储、去重缓存与运行日志均由外部系统承载，核心只依赖这里的契约。

use std::time::Duration;

use async_trait::async_trait;

use crate::core::error::Result;
use crate::core::model::{Keyword, RunRecord, StoredItem};

/// 关键词目录 (只读)
#[async_trait]
pub trait KeywordSource: Send + Sync {
    async fn active_keywords(&self) -> Result<Vec<Keyword>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// 同一条目此前已写入，保留原文档
    Existing,
}

/// 条目存储，要求按条目 ID 幂等写入
#[async_trait]
pub trait ItemStore: Send + Sync {
    async fn upsert(&self, item: &StoredItem) -> Result<UpsertOutcome>;
}

/// 带 TTL 的键值缓存
#[async_trait]
pub trait DedupCache: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn set_ex(&self, key: &str, ttl: Duration) -> Result<()>;
}

/// 运行日志接收端
#[async_trait]
pub trait RunLogSink: Send + Sync {
    /// 写入一条运行记录，返回其日志 ID
    async fn record(&self, run: &RunRecord) -> Result<String>;
}

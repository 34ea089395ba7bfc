//! 站点定义
//!
//! 搜索站点负责 URL 构建与结果解析；抓取器负责把请求送出当前隧道。两者刻意分离：
//! 抓取器不做重试，重试与隧道轮换由采集 Worker 统一调度。

use async_trait::async_trait;

use crate::core::error::Result;
use crate::core::model::{CandidateItem, Keyword};

/// 一次搜索请求的原始响应
#[derive(Debug, Clone)]
pub struct RawResult {
    pub url: String,
    pub status: u16,
    pub body: String,
}

/// 搜索站点 Trait
pub trait SearchSite: Send + Sync {
    /// 站点唯一标识，同时写入条目的 `source` 字段
    fn id(&self) -> &str;

    /// 构建关键词的搜索地址
    fn search_url(&self, keyword: &Keyword) -> Result<String>;

    /// 从原始响应中提取候选条目
    fn parse(&self, raw: &RawResult) -> Result<Vec<CandidateItem>>;

    /// 候选条目是否与关键词相关
    fn matches(&self, candidate: &CandidateItem, keyword: &Keyword) -> bool;
}

/// 抓取器 Trait
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// 通过当前活动隧道发起一次搜索请求
    async fn fetch(&self, keyword: &Keyword, endpoint: &str) -> Result<RawResult>;
}

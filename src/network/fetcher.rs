use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::core::error::Result;
use crate::core::model::Keyword;
use crate::interfaces::{Fetcher, RawResult, SearchSite};
use crate::network::service::HttpService;

/// 搜索抓取器
///
/// 单次请求，不做重试；出口即隧道池的活动节点。
pub struct SearchFetcher {
    http: HttpService,
    site: Arc<dyn SearchSite>,
}

impl SearchFetcher {
    pub fn new(http: HttpService, site: Arc<dyn SearchSite>) -> Self {
        Self { http, site }
    }
}

#[async_trait]
impl Fetcher for SearchFetcher {
    async fn fetch(&self, keyword: &Keyword, endpoint: &str) -> Result<RawResult> {
        let url = self.site.search_url(keyword)?;
        debug!(endpoint, url = %url, "发起搜索请求");

        let (status, body) = self.http.get_text(&url).await?;
        debug!(endpoint, status, bytes = body.len(), "搜索响应已接收");
        Ok(RawResult { url, status, body })
    }
}

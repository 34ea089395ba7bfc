//! YouTube 搜索站点
//!
//! 只采集第一页搜索结果 (按上传时间排序、最近一小时)，不做滚动翻页。

mod filter;
mod parser;

use url::Url;

use crate::core::config::CollectorConfig;
use crate::core::error::{CollectError, Result};
use crate::core::model::{CandidateItem, Keyword, TitleFilterMode};
use crate::interfaces::{RawResult, SearchSite};

pub use self::filter::matches_title;
pub use self::parser::{extract_initial_data, parse_search_results};

#[cfg(test)]
pub(crate) use self::parser::tests::{search_page, video};

pub struct Youtube {
    base: Url,
    search_filter: String,
    title_filter: TitleFilterMode,
    max_items: usize,
}

impl Youtube {
    pub const ID: &'static str = "youtube";

    pub fn new(config: &CollectorConfig) -> Result<Self> {
        let base = Url::parse("https://www.youtube.com/results")
            .map_err(|e| CollectError::Parse(e.to_string()))?;
        Ok(Self {
            base,
            search_filter: config.search_filter.clone(),
            title_filter: config.title_filter,
            max_items: config.max_items_per_keyword,
        })
    }
}

impl SearchSite for Youtube {
    fn id(&self) -> &str {
        Self::ID
    }

    fn search_url(&self, keyword: &Keyword) -> Result<String> {
        let mut url = self.base.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("search_query", keyword.display_text.trim());
            if !self.search_filter.is_empty() {
                query.append_pair("sp", &self.search_filter);
            }
        }
        Ok(url.into())
    }

    fn parse(&self, raw: &RawResult) -> Result<Vec<CandidateItem>> {
        let data = extract_initial_data(&raw.body)?;
        Ok(parse_search_results(&data, self.max_items))
    }

    fn matches(&self, candidate: &CandidateItem, keyword: &Keyword) -> bool {
        matches_title(&candidate.title, &keyword.display_text, self.title_filter)
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::slugify;

/// 搜索关键词 (由外部目录维护，运行期间只读)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyword {
    pub id: String,
    #[serde(alias = "keyword")]
    pub display_text: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_category() -> String {
    "uncategorized".to_string()
}

fn default_active() -> bool {
    true
}

impl Keyword {
    pub fn new(id: impl Into<String>, display_text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_text: display_text.into(),
            category: default_category(),
            active: true,
        }
    }
}

/// 标题过滤模式
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TitleFilterMode {
    /// 完整短语匹配，空格 / 连字符 / 无空格三种写法等价
    #[default]
    Exact,
    /// 所有词出现即可，不要求顺序
    AllWords,
    /// 不过滤
    Disabled,
}

/// 视频条目 (写入后不可变)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoItem {
    pub external_id: String,
    pub title: String,
    pub url: String,
    pub channel_name: String,
    pub channel_id: String,
    pub view_count: String,
    pub duration: String,
    pub published_time_text: String,
    pub thumbnail_url: String,
    pub collected_at: DateTime<Utc>,
    pub keyword_id: String,
    pub source: String,
}

/// 解析阶段产出的候选条目 (尚未绑定关键词与采集时间)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CandidateItem {
    pub external_id: String,
    pub title: String,
    pub url: String,
    pub channel_name: String,
    pub channel_id: String,
    pub view_count: String,
    pub duration: String,
    pub published_time_text: String,
    pub thumbnail_url: String,
}

impl CandidateItem {
    pub fn into_item(self, keyword_id: &str, collected_at: DateTime<Utc>, source: &str) -> VideoItem {
        VideoItem {
            external_id: self.external_id,
            title: self.title,
            url: self.url,
            channel_name: self.channel_name,
            channel_id: self.channel_id,
            view_count: self.view_count,
            duration: self.duration,
            published_time_text: self.published_time_text,
            thumbnail_url: self.thumbnail_url,
            collected_at,
            keyword_id: keyword_id.to_string(),
            source: source.to_string(),
        }
    }
}

/// 交给条目存储的文档
///
/// `hierarchy` 为上级分组 (关键词)，`document_id` 在同一分组内可按时间排序。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredItem {
    pub hierarchy: String,
    pub document_id: String,
    #[serde(flatten)]
    pub item: VideoItem,
}

impl StoredItem {
    pub fn new(item: VideoItem) -> Self {
        let document_id = document_id(&item.collected_at, &item.keyword_id, &item.external_id);
        Self {
            hierarchy: item.keyword_id.clone(),
            document_id,
            item,
        }
    }
}

/// 生成文档 ID：微秒级 ISO-8601 时间戳 + 关键词 + 条目 ID
///
/// 前缀保证字典序即时间序，后缀保证并发写入不同关键词 / 同一微秒的多个条目不冲突。
pub fn document_id(collected_at: &DateTime<Utc>, keyword_id: &str, external_id: &str) -> String {
    format!(
        "{}_{}_{}",
        collected_at.format("%Y-%m-%dT%H:%M:%S%.6fZ"),
        slugify(keyword_id),
        slugify(external_id)
    )
}

/// 单个关键词的失败记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordError {
    pub keyword_id: String,
    pub keyword: String,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub error: String,
}

/// 提前结束运行的原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail", rename_all = "snake_case")]
pub enum StopReason {
    TunnelExhausted(String),
    BudgetExceeded,
    Shutdown,
}

/// 单次运行记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub session_id: String,
    pub instance_id: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub keywords_assigned: usize,
    pub keywords_attempted: usize,
    pub keywords_succeeded: usize,
    pub keywords_failed: usize,
    pub items_collected: usize,
    #[serde(default)]
    pub tunnels_used: Vec<String>,
    #[serde(default)]
    pub failed_tunnels: Vec<String>,
    pub success_rate: f64,
    #[serde(default)]
    pub errors: Vec<KeywordError>,
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

impl RunRecord {
    pub fn start(instance_id: u32, keywords_assigned: usize, started_at: DateTime<Utc>) -> Self {
        Self {
            session_id: format!("session_{}_{}", started_at.timestamp(), instance_id),
            instance_id,
            started_at,
            finished_at: None,
            keywords_assigned,
            keywords_attempted: 0,
            keywords_succeeded: 0,
            keywords_failed: 0,
            items_collected: 0,
            tunnels_used: Vec::new(),
            failed_tunnels: Vec::new(),
            success_rate: 0.0,
            errors: Vec::new(),
            duration_seconds: 0.0,
            stop_reason: None,
        }
    }

    pub fn record_success(&mut self, items: usize) {
        self.keywords_attempted += 1;
        self.keywords_succeeded += 1;
        self.items_collected += items;
    }

    /// 失败的关键词仍然计入已持久化的条目，避免低报
    pub fn record_failure(&mut self, error: KeywordError, items_persisted: usize) {
        self.keywords_attempted += 1;
        self.keywords_failed += 1;
        self.items_collected += items_persisted;
        self.errors.push(error);
    }

    pub fn finalize(
        &mut self,
        finished_at: DateTime<Utc>,
        tunnels_used: Vec<String>,
        failed_tunnels: Vec<String>,
    ) {
        self.finished_at = Some(finished_at);
        self.tunnels_used = tunnels_used;
        self.failed_tunnels = failed_tunnels;
        self.success_rate = if self.keywords_attempted == 0 {
            0.0
        } else {
            self.keywords_succeeded as f64 / self.keywords_attempted as f64
        };
        self.duration_seconds =
            (finished_at - self.started_at).num_milliseconds().max(0) as f64 / 1000.0;
    }

    /// 人类可读的日志文档 ID
    pub fn log_id(&self) -> String {
        format!(
            "{}_instance_{}",
            self.started_at.format("%Y-%m-%d_%H-%M-%S"),
            self.instance_id
        )
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 10, h, m, s).unwrap()
    }

    #[test]
    fn keyword_deserializes_legacy_field_name() {
        let kw: Keyword =
            serde_json::from_str(r#"{"id":"grok-3","keyword":"grok 3"}"#).unwrap();
        assert_eq!(kw.display_text, "grok 3");
        assert_eq!(kw.category, "uncategorized");
        assert!(kw.active);
    }

    #[test]
    fn document_ids_sort_by_time_and_differ_by_keyword() {
        let early = document_id(&at(18, 30, 2), "grok 3", "abc");
        let late = document_id(&at(18, 30, 3), "chatgpt", "abc");
        let sibling = document_id(&at(18, 30, 2), "claude", "abc");

        assert!(early < late);
        assert_ne!(early, sibling);
        assert!(early.starts_with("2025-08-10T18:30:02.000000Z_"));
    }

    #[test]
    fn zero_attempts_reports_zero_success_rate() {
        let mut run = RunRecord::start(2, 5, at(10, 0, 0));
        run.finalize(at(10, 0, 30), vec![], vec![]);
        assert_eq!(run.success_rate, 0.0);
        assert_eq!(run.duration_seconds, 30.0);
        assert_eq!(run.keywords_attempted, 0);
    }

    #[test]
    fn success_rate_reflects_true_counts() {
        let mut run = RunRecord::start(1, 4, at(10, 0, 0));
        run.record_success(3);
        run.record_success(0);
        run.record_failure(
            KeywordError {
                keyword_id: "k3".into(),
                keyword: "k3".into(),
                attempts: 3,
                endpoint: None,
                error: "Parsing error".into(),
            },
            0,
        );
        run.finalize(at(10, 1, 0), vec!["us-nyc".into()], vec![]);

        assert_eq!(run.keywords_attempted, 3);
        assert_eq!(run.keywords_succeeded, 2);
        assert_eq!(run.keywords_failed, 1);
        assert_eq!(run.items_collected, 3);
        assert!((run.success_rate - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn log_id_is_readable_timestamp() {
        let run = RunRecord::start(3, 0, at(9, 5, 7));
        assert_eq!(run.log_id(), "2025-08-10_09-05-07_instance_3");
        assert_eq!(run.session_id, format!("session_{}_3", at(9, 5, 7).timestamp()));
    }
}

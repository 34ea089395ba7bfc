//! 搜索结果页解析
//!
//! 结果页内嵌 `ytInitialData` JSON，视频条目位于
//! `contents.twoColumnSearchResultsRenderer.primaryContents.sectionListRenderer.contents[]
//! .itemSectionRenderer.contents[].videoRenderer`。

use std::collections::HashSet;

use serde_json::Value;
use tracing::debug;

use crate::core::error::{CollectError, Result};
use crate::core::model::CandidateItem;

const MARKER: &str = "ytInitialData";
const SECTIONS_POINTER: &str =
    "/contents/twoColumnSearchResultsRenderer/primaryContents/sectionListRenderer/contents";

/// 从 HTML 中提取 `ytInitialData` 对象
///
/// 兼容 `var ytInitialData = {...};` 与 `window["ytInitialData"] = {...};` 两种写法，
/// 只反序列化紧随其后的一个 JSON 值，忽略脚本剩余部分。
pub fn extract_initial_data(html: &str) -> Result<Value> {
    let mut search_from = 0;
    while let Some(pos) = html[search_from..].find(MARKER) {
        let after = search_from + pos + MARKER.len();
        search_from = after;

        let rest = &html[after..];
        let Some(eq) = rest.find('=') else { break };
        if !rest[..eq].chars().all(|c| c.is_whitespace() || c == '"' || c == ']' || c == '\'') {
            continue;
        }
        let json = rest[eq + 1..].trim_start();
        if !json.starts_with('{') {
            continue;
        }

        return match serde_json::Deserializer::from_str(json).into_iter::<Value>().next() {
            Some(Ok(value)) => Ok(value),
            Some(Err(e)) => Err(CollectError::Parse(format!("malformed ytInitialData: {}", e))),
            None => Err(CollectError::Parse("empty ytInitialData".into())),
        };
    }
    Err(CollectError::Parse("ytInitialData not found".into()))
}

/// 提取视频候选条目 (同一页内按 ID 去重，保持页面顺序)
pub fn parse_search_results(data: &Value, limit: usize) -> Vec<CandidateItem> {
    let Some(sections) = data.pointer(SECTIONS_POINTER).and_then(Value::as_array) else {
        debug!("结果页不含搜索分区，视为空结果");
        return Vec::new();
    };

    let mut seen = HashSet::new();
    sections
        .iter()
        .filter_map(|section| section.pointer("/itemSectionRenderer/contents"))
        .filter_map(Value::as_array)
        .flatten()
        .filter_map(|item| item.get("videoRenderer"))
        .filter_map(video_from_renderer)
        .filter(|video| seen.insert(video.external_id.clone()))
        .take(limit)
        .collect()
}

fn video_from_renderer(renderer: &Value) -> Option<CandidateItem> {
    let raw_id = renderer.get("videoId").and_then(Value::as_str)?;
    let external_id = raw_id.strip_prefix("shorts/").unwrap_or(raw_id).trim().to_string();
    if external_id.is_empty() {
        return None;
    }

    let text = |pointer: &str| {
        renderer
            .pointer(pointer)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    let thumbnail_url = renderer
        .pointer("/thumbnail/thumbnails")
        .and_then(Value::as_array)
        .and_then(|thumbs| thumbs.last())
        .and_then(|t| t.get("url"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Some(CandidateItem {
        url: format!("https://www.youtube.com/watch?v={}", external_id),
        title: title_text(renderer),
        channel_name: text("/ownerText/runs/0/text"),
        channel_id: text("/ownerText/runs/0/navigationEndpoint/browseEndpoint/browseId"),
        view_count: text("/viewCountText/simpleText"),
        duration: text("/lengthText/simpleText"),
        published_time_text: text("/publishedTimeText/simpleText"),
        thumbnail_url,
        external_id,
    })
}

/// 标题由多个 run 组成时按顺序拼接 (run 边界不一定是词边界)
fn title_text(renderer: &Value) -> String {
    if let Some(runs) = renderer.pointer("/title/runs").and_then(Value::as_array) {
        let title: String = runs
            .iter()
            .filter_map(|run| run.get("text").and_then(Value::as_str))
            .collect();
        if !title.is_empty() {
            return title.trim().to_string();
        }
    }
    renderer
        .pointer("/title/simpleText")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string()
}

#[cfg(test)]
pub(crate) mod tests {
    use serde_json::json;

    use super::*;

    pub(crate) fn video(id: &str, title: &str) -> Value {
        json!({
            "videoRenderer": {
                "videoId": id,
                "title": { "runs": [{ "text": title }] },
                "ownerText": { "runs": [{
                    "text": "AI Explained",
                    "navigationEndpoint": { "browseEndpoint": { "browseId": "UCNJ1Ymd5yFuUPtn21xtRbbw" } }
                }] },
                "viewCountText": { "simpleText": "1,234 views" },
                "lengthText": { "simpleText": "12:34" },
                "publishedTimeText": { "simpleText": "5 minutes ago" },
                "thumbnail": { "thumbnails": [
                    { "url": "https://i.ytimg.com/vi/x/default.jpg" },
                    { "url": "https://i.ytimg.com/vi/x/hq720.jpg" }
                ] }
            }
        })
    }

    /// 构造一个最小的搜索结果页
    pub(crate) fn search_page(items: Vec<Value>) -> String {
        let data = json!({
            "contents": { "twoColumnSearchResultsRenderer": { "primaryContents": {
                "sectionListRenderer": { "contents": [
                    { "itemSectionRenderer": { "contents": items } },
                    { "continuationItemRenderer": {} }
                ] }
            } } }
        });
        format!(
            "<html><script>var ytcfg = {{}};</script><script nonce=\"n\">var ytInitialData = {};</script><script>var other = {{\"a\": 1}};</script></html>",
            data
        )
    }

    #[test]
    fn extracts_video_fields() {
        let html = search_page(vec![video("dQw4w9WgXcQ", "Grok 3 Release")]);
        let data = extract_initial_data(&html).unwrap();
        let items = parse_search_results(&data, 100);

        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.external_id, "dQw4w9WgXcQ");
        assert_eq!(item.title, "Grok 3 Release");
        assert_eq!(item.url, "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
        assert_eq!(item.channel_name, "AI Explained");
        assert_eq!(item.channel_id, "UCNJ1Ymd5yFuUPtn21xtRbbw");
        assert_eq!(item.view_count, "1,234 views");
        assert_eq!(item.duration, "12:34");
        assert_eq!(item.published_time_text, "5 minutes ago");
        assert_eq!(item.thumbnail_url, "https://i.ytimg.com/vi/x/hq720.jpg");
    }

    #[test]
    fn title_runs_are_concatenated() {
        let renderer = json!({
            "videoId": "abc",
            "title": { "runs": [{ "text": "Grok" }, { "text": "3" }, { "text": " is here" }] }
        });
        assert_eq!(video_from_renderer(&renderer).unwrap().title, "Grok3 is here");

        let simple = json!({ "videoId": "abc", "title": { "simpleText": " Plain " } });
        assert_eq!(video_from_renderer(&simple).unwrap().title, "Plain");
    }

    #[test]
    fn skips_non_video_and_strips_shorts_prefix() {
        let html = search_page(vec![
            json!({ "shelfRenderer": {} }),
            json!({ "videoRenderer": { "title": { "simpleText": "no id" } } }),
            video("shorts/Ab_cD-12345", "short"),
            video("Ab_cD-12345", "dup"),
        ]);
        let items = parse_search_results(&extract_initial_data(&html).unwrap(), 100);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].external_id, "Ab_cD-12345");
    }

    #[test]
    fn window_assignment_form_is_supported() {
        let html = r#"<script>window["ytInitialData"] = {"contents": {}};</script>"#;
        assert!(extract_initial_data(html).is_ok());
    }

    #[test]
    fn zero_videos_is_valid_empty_result() {
        let html = search_page(vec![]);
        let data = extract_initial_data(&html).unwrap();
        assert!(parse_search_results(&data, 100).is_empty());
    }

    #[test]
    fn missing_or_malformed_data_is_parse_error() {
        let consent = "<html><form action=\"https://consent.youtube.com/save\"></form></html>";
        assert!(matches!(
            extract_initial_data(consent),
            Err(CollectError::Parse(_))
        ));

        let truncated = "<script>var ytInitialData = {\"contents\": {\"twoColumn";
        assert!(matches!(
            extract_initial_data(truncated),
            Err(CollectError::Parse(_))
        ));
    }

    #[test]
    fn limit_caps_results() {
        let html = search_page((0..5).map(|i| video(&format!("id{i}"), "t")).collect());
        let items = parse_search_results(&extract_initial_data(&html).unwrap(), 3);
        assert_eq!(items.len(), 3);
    }
}

//! 标题相关性过滤

use crate::core::model::TitleFilterMode;

/// 判断标题是否与关键词相关 (大小写不敏感)
///
/// `Exact` 模式下单词关键词做子串匹配；多词关键词要求以下任一写法作为连续子串出现：
/// 原短语、空格换成连字符、去掉空格。例如 "grok 3" 匹配 "Grok 3" / "grok-3" / "Grok3"，
/// 但不匹配 "3 grok"。
pub fn matches_title(title: &str, keyword: &str, mode: TitleFilterMode) -> bool {
    if mode == TitleFilterMode::Disabled {
        return true;
    }

    let keyword = keyword.to_lowercase();
    let words: Vec<&str> = keyword.split_whitespace().collect();
    if words.is_empty() {
        return false;
    }
    let title = normalize(title);

    match mode {
        TitleFilterMode::AllWords => words.iter().all(|w| title.contains(w)),
        _ if words.len() == 1 => title.contains(words[0]),
        _ => [words.join(" "), words.join("-"), words.concat()]
            .iter()
            .any(|variant| title.contains(variant.as_str())),
    }
}

/// 小写并折叠连续空白
fn normalize(title: &str) -> String {
    title
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::core::model::TitleFilterMode::*;

    #[test]
    fn multi_word_phrase_variants() {
        assert!(matches_title("Grok 3 Release", "grok 3", Exact));
        assert!(matches_title("grok-3 demo", "grok 3", Exact));
        assert!(matches_title("Grok3 Features", "grok 3", Exact));
        assert!(!matches_title("3 grok", "grok 3", Exact));
    }

    #[test]
    fn single_word_is_substring() {
        assert!(matches_title("ChatGPT tips", "chatgpt", Exact));
        assert!(matches_title("why CHATGPT-5 matters", "ChatGPT", Exact));
        assert!(!matches_title("Gemini review", "chatgpt", Exact));
    }

    #[test]
    fn whitespace_runs_do_not_break_phrases() {
        assert!(matches_title("Claude   Code  walkthrough", "claude code", Exact));
        assert!(matches_title("claude code", "  Claude\tCode ", Exact));
    }

    #[test]
    fn all_words_ignores_order() {
        assert!(matches_title("3 reasons grok wins", "grok 3", AllWords));
        assert!(!matches_title("grok wins", "grok 3", AllWords));
    }

    #[test]
    fn disabled_accepts_everything() {
        assert!(matches_title("unrelated", "grok 3", Disabled));
    }

    #[test]
    fn blank_keyword_matches_nothing() {
        assert!(!matches_title("anything", "   ", Exact));
    }
}

use std::path::PathBuf;

use async_trait::async_trait;
use config::{Config, File};
use tracing::debug;

use crate::core::error::{CollectError, Result};
use crate::core::model::Keyword;
use crate::interfaces::KeywordSource;

/// 文件关键词目录
///
/// 格式由扩展名决定 (TOML / JSON / YAML)，顶层为 `keywords` 数组：
///
/// ```toml
/// [[keywords]]
/// id = "grok-3"
/// keyword = "grok 3"
/// category = "ai_models"
/// ```
pub struct FileKeywordSource {
    path: PathBuf,
}

impl FileKeywordSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// 读取全部条目 (包含停用项)
    pub fn load_all(&self) -> Result<Vec<Keyword>> {
        if !self.path.exists() {
            return Err(CollectError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("keyword file not found: {}", self.path.display()),
            )));
        }

        let keywords: Vec<Keyword> = Config::builder()
            .add_source(File::from(self.path.as_path()))
            .build()?
            .get("keywords")?;
        Ok(keywords)
    }
}

#[async_trait]
impl KeywordSource for FileKeywordSource {
    async fn active_keywords(&self) -> Result<Vec<Keyword>> {
        let keywords = self.load_all()?;
        let total = keywords.len();
        let active: Vec<Keyword> = keywords.into_iter().filter(|k| k.active).collect();
        debug!(path = %self.path.display(), total, active = active.len(), "关键词目录已加载");
        Ok(active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_toml_catalog_and_drops_inactive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keywords.toml");
        std::fs::write(
            &path,
            r#"
[[keywords]]
id = "grok-3"
keyword = "grok 3"
category = "ai_models"

[[keywords]]
id = "bard"
keyword = "bard"
active = false

[[keywords]]
id = "chatgpt"
display_text = "ChatGPT"
"#,
        )
        .unwrap();

        let source = FileKeywordSource::new(&path);
        let active = source.active_keywords().await.unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].display_text, "grok 3");
        assert_eq!(active[0].category, "ai_models");
        assert_eq!(active[1].display_text, "ChatGPT");
        assert_eq!(active[1].category, "uncategorized");
        assert_eq!(source.load_all().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn reads_json_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keywords.json");
        std::fs::write(&path, r#"{"keywords":[{"id":"claude","keyword":"claude"}]}"#).unwrap();
        let active = FileKeywordSource::new(&path).active_keywords().await.unwrap();
        assert_eq!(active, vec![Keyword::new("claude", "claude")]);
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let source = FileKeywordSource::new("/nonexistent/keywords.toml");
        assert!(source.active_keywords().await.is_err());
    }
}

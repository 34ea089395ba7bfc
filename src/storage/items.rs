use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use crate::core::error::{CollectError, Result};
use crate::core::model::StoredItem;
use crate::interfaces::{ItemStore, UpsertOutcome};
use crate::utils::{file_exists, save_file, slugify};

/// JSON 文件条目存储
///
/// 布局为 `<root>/<关键词>/<条目 ID>.json`，同一关键词下同一条目只保留首次写入的文档。
/// 两级目录名都由 [`path_segment`] 生成，不同的关键词 / 条目 ID 不会落到同一路径。
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, item: &StoredItem) -> PathBuf {
        self.root
            .join(path_segment(&item.hierarchy))
            .join(format!("{}.json", path_segment(&item.item.external_id)))
    }
}

#[async_trait]
impl ItemStore for JsonFileStore {
    async fn upsert(&self, item: &StoredItem) -> Result<UpsertOutcome> {
        let path = self.path_for(item);
        if file_exists(&path).await {
            debug!(path = %path.display(), "条目已存在，跳过写入");
            return Ok(UpsertOutcome::Existing);
        }

        let json = serde_json::to_vec_pretty(item)?;
        save_file(&path, &json)
            .await
            .map_err(|e| CollectError::Persistence(format!("{}: {}", path.display(), e)))?;
        Ok(UpsertOutcome::Inserted)
    }
}

/// 把任意标识映射为单个路径段
///
/// 只含 `[A-Za-z0-9_-]` 的输入 (例如视频 ID) 原样保留；其他输入取 slug 并追加 `~` 与
/// 原文的 blake3 摘要前缀。`~` 不属于原样保留的字符集，两类结果互不重叠。
fn path_segment(raw: &str) -> String {
    let safe = !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if safe {
        return raw.to_string();
    }
    let digest = blake3::hash(raw.as_bytes()).to_hex();
    format!("{}~{}", slugify(raw), &digest.as_str()[..12])
}

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::info;

use crate::core::error::{CollectError, Result};
use crate::core::model::RunRecord;
use crate::interfaces::RunLogSink;
use crate::utils::{file_exists, save_file};

/// 运行日志写入 `<dir>/<YYYY-MM-DD_HH-MM-SS>_instance_<n>.json`
pub struct JsonFileLogSink {
    dir: PathBuf,
}

impl JsonFileLogSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl RunLogSink for JsonFileLogSink {
    async fn record(&self, run: &RunRecord) -> Result<String> {
        // 同一秒内重复启动时追加序号，避免覆盖
        let base = run.log_id();
        let mut log_id = base.clone();
        let mut n = 1;
        while file_exists(self.dir.join(format!("{}.json", log_id))).await {
            n += 1;
            log_id = format!("{}_{}", base, n);
        }

        let path = self.dir.join(format!("{}.json", log_id));
        let json = serde_json::to_vec_pretty(run)?;
        save_file(&path, &json)
            .await
            .map_err(|e| CollectError::Persistence(format!("{}: {}", path.display(), e)))?;
        info!(log_id = %log_id, "运行日志已写入");
        Ok(log_id)
    }
}

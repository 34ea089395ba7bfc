//! 去重缓存后端
//!
//! - `UpstashCache`: Redis REST 协议 (Upstash)，多实例共享，键按实例命名空间隔离
//! - `MemoryCache`: 进程内 TTL 表，未配置远程凭据时使用

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, Url};
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::core::config::DedupConfig;
use crate::core::error::{CollectError, Result};
use crate::interfaces::DedupCache;

pub struct UpstashCache {
    client: Client,
    url: Url,
    token: String,
}

impl UpstashCache {
    pub fn new(url: &str, token: &str, timeout: Duration) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| CollectError::Cache(format!("invalid url: {}", e)))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CollectError::Cache(e.to_string()))?;
        Ok(Self {
            client,
            url,
            token: token.to_string(),
        })
    }

    /// 执行单条命令，返回 `result` 字段
    async fn command(&self, args: Value) -> Result<Value> {
        let resp = self
            .client
            .post(self.url.clone())
            .bearer_auth(&self.token)
            .json(&args)
            .send()
            .await
            .map_err(|e| CollectError::Cache(e.to_string()))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| CollectError::Cache(e.to_string()))?;

        if let Some(err) = body.get("error").and_then(Value::as_str) {
            return Err(CollectError::Cache(err.to_string()));
        }
        if !status.is_success() {
            return Err(CollectError::Cache(format!("HTTP {}", status)));
        }
        body.get("result")
            .cloned()
            .ok_or_else(|| CollectError::Cache("response has no result field".into()))
    }
}

#[async_trait]
impl DedupCache for UpstashCache {
    async fn exists(&self, key: &str) -> Result<bool> {
        let result = self.command(json!(["EXISTS", key])).await?;
        Ok(result.as_i64().unwrap_or(0) > 0)
    }

    async fn set_ex(&self, key: &str, ttl: Duration) -> Result<()> {
        let secs = ttl.as_secs().max(1);
        self.command(json!(["SETEX", key, secs, "1"])).await?;
        Ok(())
    }
}

/// 进程内 TTL 缓存
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Instant>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DedupCache for MemoryCache {
    async fn exists(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(&expires) if expires > now => Ok(true),
            Some(_) => {
                entries.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn set_ex(&self, key: &str, ttl: Duration) -> Result<()> {
        self.entries.lock().insert(key.to_string(), Instant::now() + ttl);
        Ok(())
    }
}

/// 按配置选择缓存后端
pub fn build_cache(config: &DedupConfig) -> Result<Arc<dyn DedupCache>> {
    match (&config.upstash_url, &config.upstash_token) {
        (Some(url), Some(token)) if !url.is_empty() && !token.is_empty() => {
            debug!(url = %url, "使用 Upstash 去重缓存");
            Ok(Arc::new(UpstashCache::new(
                url,
                token,
                Duration::from_secs(config.timeout_secs),
            )?))
        }
        _ => {
            info!("未配置远程缓存凭据，使用进程内去重缓存 (跨运行不保留)");
            Ok(Arc::new(MemoryCache::new()))
        }
    }
}

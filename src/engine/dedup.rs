//! 去重闸门
//!
//! 仅作为优化：缓存异常时按 "未见过" 处理 (fail open)，宁可重复写入也不漏采。

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::warn;

use crate::interfaces::DedupCache;

/// 实例命名空间内的去重键
pub fn dedup_key(instance_id: u32, external_id: &str) -> String {
    format!("instance_{}:video:{}", instance_id, external_id)
}

pub struct DedupGate {
    cache: Arc<dyn DedupCache>,
    timeout: Duration,
}

impl DedupGate {
    pub fn new(cache: Arc<dyn DedupCache>, timeout: Duration) -> Self {
        Self { cache, timeout }
    }

    pub async fn seen(&self, instance_id: u32, external_id: &str) -> bool {
        let key = dedup_key(instance_id, external_id);
        match timeout(self.timeout, self.cache.exists(&key)).await {
            Ok(Ok(seen)) => seen,
            Ok(Err(e)) => {
                warn!(key = %key, "去重缓存查询失败，按未见过处理: {}", e);
                false
            }
            Err(_) => {
                warn!(key = %key, "去重缓存查询超时，按未见过处理");
                false
            }
        }
    }

    pub async fn mark_seen(&self, instance_id: u32, external_id: &str, ttl: Duration) {
        let key = dedup_key(instance_id, external_id);
        match timeout(self.timeout, self.cache.set_ex(&key, ttl)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(key = %key, "去重标记写入失败: {}", e),
            Err(_) => warn!(key = %key, "去重标记写入超时"),
        }
    }
}

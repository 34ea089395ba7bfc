//! 采集引擎
//!
//! 负责单个实例一次运行的生命周期：加锁 -> 发现关键词 -> 准备隧道 -> 执行 -> 收尾

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::{AppConfig, SingboxConfig};
use crate::core::model::{Keyword, RunRecord};
use crate::engine::context::WorkerContext;
use crate::engine::dedup::DedupGate;
use crate::engine::retry::RetryPolicy;
use crate::engine::scheduler::{assignment_for, partition, prepare_keywords};
use crate::engine::worker;
use crate::interfaces::KeywordSource;
use crate::network::cache::build_cache;
use crate::network::fetcher::SearchFetcher;
use crate::network::service::HttpService;
use crate::network::tunnel::{PoolPolicy, TunnelPool};
use crate::sites::SiteRegistry;
use crate::storage::{FileKeywordSource, JsonFileLogSink, JsonFileStore};
use crate::utils::lock::InstanceLock;
use crate::utils::singbox::SingBoxController;

pub struct CollectorEngine {
    config: Arc<AppConfig>,
}

impl CollectorEngine {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self { config }
    }

    fn cache_path(&self) -> &Path {
        Path::new(&self.config.cache_path)
    }

    fn state_path(&self, instance: u32) -> PathBuf {
        self.cache_path()
            .join(format!("tunnel_state_instance_{}.json", instance))
    }

    /// 执行单个实例的一轮采集
    pub async fn collect(&self, instance: u32, shutdown: CancellationToken) -> anyhow::Result<RunRecord> {
        let instances = self.config.scheduler.instances;
        if instance == 0 || instance > instances {
            bail!("instance must be within 1..={}, got {}", instances, instance);
        }

        // 1. 实例互斥
        let cycle = Duration::from_secs(self.config.scheduler.cycle_secs);
        let _lock = InstanceLock::acquire(self.cache_path(), instance, cycle)?
            .ok_or_else(|| anyhow!("instance {} is already running", instance))?;

        // 2. 关键词发现 (Discover)
        let keywords = self.assigned_keywords(instance).await?;
        info!(instance, keywords = keywords.len(), "关键词分配完成");

        // 3. 隧道准备 (Prepare)
        let endpoints = assignment_for(&self.config.endpoints, instances, instance);
        if endpoints.is_empty() {
            warn!(instance, "该实例未分配到任何出口节点");
        }
        let singbox = self.config.singbox.for_instance(instance);
        let controller = Arc::new(SingBoxController::new(
            &singbox,
            &self.config.instance_cache_dir(instance),
        )?);
        if singbox.manage_process {
            controller
                .launch(&endpoints, &singbox)
                .await
                .context("sing-box 启动失败")?;
        }

        let mut pool = TunnelPool::new(
            endpoints.iter().map(|e| e.address.clone()).collect(),
            controller.clone(),
            PoolPolicy::from(&self.config.collector),
        );
        let state_path = self.state_path(instance);
        pool.restore(&state_path);

        // 4. 执行 (Loop)
        let ctx = self.worker_context(instance, &singbox, shutdown)?;
        let record = worker::run(&ctx, &mut pool, &keywords).await;

        // 5. 收尾 (Post-process)
        pool.release().await;
        if let Err(e) = pool.persist(&state_path).await {
            warn!("保存隧道状态失败: {}", e);
        }
        if singbox.manage_process
            && let Err(e) = controller.stop().await
        {
            warn!("停止 sing-box 失败: {:#}", e);
        }

        Ok(record)
    }

    /// 读取、预处理并切分关键词，返回指定实例的分片
    pub async fn assigned_keywords(&self, instance: u32) -> anyhow::Result<Vec<Keyword>> {
        let all = self.prepared_keywords().await?;
        Ok(assignment_for(&all, self.config.scheduler.instances, instance))
    }

    /// 全部实例的关键词分配 (实例编号从 1 开始)
    pub async fn plan(&self) -> anyhow::Result<Vec<(u32, Vec<Keyword>)>> {
        let all = self.prepared_keywords().await?;
        Ok(partition(&all, self.config.scheduler.instances as usize)
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| (i as u32 + 1, chunk))
            .collect())
    }

    async fn prepared_keywords(&self) -> anyhow::Result<Vec<Keyword>> {
        let source = FileKeywordSource::new(&self.config.keywords.path);
        let keywords = source
            .active_keywords()
            .await
            .with_context(|| format!("无法读取关键词目录 {}", self.config.keywords.path))?;
        let prepared = prepare_keywords(keywords);
        debug!(total = prepared.len(), "关键词预处理完成");
        Ok(prepared)
    }

    fn worker_context(
        &self,
        instance: u32,
        singbox: &SingboxConfig,
        shutdown: CancellationToken,
    ) -> anyhow::Result<WorkerContext> {
        let collector = &self.config.collector;
        let registry = SiteRegistry::new();
        let site = registry
            .create(&collector.site, collector)
            .ok_or_else(|| {
                anyhow!(
                    "unknown site: {} (available: {})",
                    collector.site,
                    registry.list().join(", ")
                )
            })??;

        let http = HttpService::new(Some(singbox.proxy_url().as_str()), collector)?;
        let fetcher = Arc::new(SearchFetcher::new(http, site.clone()));
        let cache = build_cache(&self.config.dedup)?;

        Ok(WorkerContext::builder()
            .instance_id(instance)
            .site(site)
            .fetcher(fetcher)
            .dedup(DedupGate::new(
                cache,
                Duration::from_secs(self.config.dedup.timeout_secs),
            ))
            .store(Arc::new(JsonFileStore::new(self.cache_path().join("items"))))
            .log_sink(Arc::new(JsonFileLogSink::new(
                self.cache_path().join("collection_logs"),
            )))
            .retry(RetryPolicy::from(collector))
            .dedup_ttl(Duration::from_secs(self.config.dedup.ttl_secs))
            .budget(collector.run_budget())
            .shutdown(shutdown)
            .build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{KeywordsConfig, SchedulerConfig};

    fn engine(dir: &Path, instances: u32) -> CollectorEngine {
        let keywords = dir.join("keywords.toml");
        let mut body = String::new();
        for i in 0..16 {
            body.push_str(&format!("[[keywords]]\nid = \"k{i:02}\"\nkeyword = \"topic {i:02}\"\n\n"));
        }
        std::fs::write(&keywords, body).unwrap();

        let config = AppConfig::builder()
            .cache_path(dir.join("cache").to_string_lossy().into_owned())
            .keywords(
                KeywordsConfig::builder()
                    .path(keywords.to_string_lossy().into_owned())
                    .build(),
            )
            .scheduler(SchedulerConfig::builder().instances(instances).build())
            .build();
        CollectorEngine::new(Arc::new(config))
    }

    #[tokio::test]
    async fn plan_covers_every_keyword_once() {
        let dir = tempfile::tempdir().unwrap();
        let plan = engine(dir.path(), 3).plan().await.unwrap();

        let sizes: Vec<usize> = plan.iter().map(|(_, k)| k.len()).collect();
        assert_eq!(sizes, vec![6, 5, 5]);
        assert_eq!(plan[0].0, 1);
        assert_eq!(plan[0].1[0].id, "k00");
        assert_eq!(plan[2].1[4].id, "k15");
    }

    #[tokio::test]
    async fn assignment_matches_plan() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), 3);
        let plan = engine.plan().await.unwrap();
        assert_eq!(engine.assigned_keywords(2).await.unwrap(), plan[1].1);
    }

    #[tokio::test]
    async fn rejects_out_of_range_instance() {
        let dir = tempfile::tempdir().unwrap();
        let err = engine(dir.path(), 3)
            .collect(4, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("1..=3"));
    }
}

//! 配置管理系统 (Configuration Management)
//!
//! 负责 `config.toml` 的反序列化及其层级结构映射，支持 `TRENDSCOUT__*` 环境变量覆盖与默认值回退。

use std::path::Path;
use std::time::Duration;

use bon::Builder;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::core::error::{CollectError, Result};
use crate::core::model::TitleFilterMode;

/// 全局应用配置
#[derive(Debug, Deserialize, Builder, Clone)]
pub struct AppConfig {
    /// 缓存与持久化目录基准路径
    #[serde(default = "default_cache_path")]
    #[builder(default = default_cache_path())]
    pub cache_path: String,

    /// 代理枢纽 (sing-box) 相关配置
    #[serde(default)]
    #[builder(default)]
    pub singbox: SingboxConfig,

    /// 全部出口节点，按实例切分为互不重叠的子池
    #[serde(default)]
    #[builder(default)]
    pub endpoints: Vec<EndpointConfig>,

    #[serde(default)]
    #[builder(default)]
    pub collector: CollectorConfig,

    #[serde(default)]
    #[builder(default)]
    pub dedup: DedupConfig,

    #[serde(default)]
    #[builder(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    #[builder(default)]
    pub keywords: KeywordsConfig,
}

/// 代理网络配置
///
/// 端口为实例 1 的基准值，实例 N 使用 `base + (N - 1)`，保证并行实例互不抢占。
#[derive(Debug, Deserialize, Builder, Clone)]
pub struct SingboxConfig {
    /// 二进制执行文件搜索路径
    #[serde(default = "default_bin_path")]
    #[builder(default = default_bin_path())]
    pub bin_path: String,
    /// 预先准备好的 sing-box 配置；缺省时根据 `endpoints` 自动渲染
    pub config_file: Option<String>,
    /// 是否由采集进程负责拉起与回收 sing-box
    #[serde(default = "default_true")]
    #[builder(default = true)]
    pub manage_process: bool,
    #[serde(default = "default_proxy_port")]
    #[builder(default = default_proxy_port())]
    pub proxy_port: u16,
    #[serde(default = "default_api_port")]
    #[builder(default = default_api_port())]
    pub api_port: u16,
    #[serde(default)]
    #[builder(default)]
    pub api_secret: String,
    /// Clash API 中用于切换出口的选择器
    #[serde(default = "default_selector")]
    #[builder(default = default_selector())]
    pub selector: String,
    /// 断开隧道时选择器切换到的出站
    #[serde(default = "default_idle_outbound")]
    #[builder(default = default_idle_outbound())]
    pub idle_outbound: String,
    /// 出口探测地址，需返回包含 `ip` 字段的 JSON
    #[serde(default = "default_health_url")]
    #[builder(default = default_health_url())]
    pub health_url: String,
    #[serde(default = "default_health_timeout")]
    #[builder(default = default_health_timeout())]
    pub health_timeout_secs: u64,
    /// WireGuard 本地私钥 (所有节点共用)
    pub private_key: Option<String>,
    #[serde(default = "default_local_address")]
    #[builder(default = default_local_address())]
    pub local_address: Vec<String>,
}

/// 单个出口节点
#[derive(Debug, Deserialize, Builder, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    /// 节点唯一地址，同时作为 sing-box 出站标签
    pub address: String,
    /// WireGuard 对端地址；缺省时使用 `address`
    pub server: Option<String>,
    #[serde(default = "default_wireguard_port")]
    #[builder(default = default_wireguard_port())]
    pub server_port: u16,
    pub public_key: Option<String>,
}

/// 采集器参数
#[derive(Debug, Deserialize, Builder, Clone)]
pub struct CollectorConfig {
    /// 搜索站点标识
    #[serde(default = "default_site")]
    #[builder(default = default_site())]
    pub site: String,
    /// 单次搜索请求超时
    #[serde(default = "default_request_timeout")]
    #[builder(default = default_request_timeout())]
    pub request_timeout_secs: u64,
    /// 单个关键词的最大尝试次数
    #[serde(default = "default_max_attempts")]
    #[builder(default = default_max_attempts())]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    #[builder(default = default_retry_base_ms())]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    #[builder(default = default_retry_max_ms())]
    pub retry_max_ms: u64,
    /// 连续失败多少次后节点判定为 failed
    #[serde(default = "default_failure_threshold")]
    #[builder(default = default_failure_threshold())]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_base")]
    #[builder(default = default_cooldown_base())]
    pub cooldown_base_secs: u64,
    #[serde(default = "default_cooldown_max")]
    #[builder(default = default_cooldown_max())]
    pub cooldown_max_secs: u64,
    /// 一次 rotate 内最多尝试连接的节点数
    #[serde(default = "default_rotation_attempts")]
    #[builder(default = default_rotation_attempts())]
    pub max_rotation_attempts: u32,
    /// 整轮运行的墙钟预算
    #[serde(default = "default_run_budget")]
    #[builder(default = default_run_budget())]
    pub run_budget_secs: u64,
    #[serde(default)]
    #[builder(default)]
    pub title_filter: TitleFilterMode,
    /// YouTube 搜索过滤参数 (`sp`，未编码)，默认 "上传时间排序 + 最近一小时"；留空则不过滤
    #[serde(default = "default_search_filter")]
    #[builder(default = default_search_filter())]
    pub search_filter: String,
    #[serde(default = "default_max_items")]
    #[builder(default = default_max_items())]
    pub max_items_per_keyword: usize,
    #[serde(default = "default_user_agent")]
    #[builder(default = default_user_agent())]
    pub user_agent: String,
}

/// 去重缓存配置
#[derive(Debug, Deserialize, Builder, Clone)]
pub struct DedupConfig {
    #[serde(default = "default_dedup_ttl")]
    #[builder(default = default_dedup_ttl())]
    pub ttl_secs: u64,
    /// Upstash Redis REST 地址；与 token 同时存在时启用远程缓存
    pub upstash_url: Option<String>,
    pub upstash_token: Option<String>,
    #[serde(default = "default_cache_timeout")]
    #[builder(default = default_cache_timeout())]
    pub timeout_secs: u64,
}

/// 多实例调度参数
#[derive(Debug, Deserialize, Builder, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_instances")]
    #[builder(default = default_instances())]
    pub instances: u32,
    #[serde(default = "default_cycle")]
    #[builder(default = default_cycle())]
    pub cycle_secs: u64,
    #[serde(default = "default_stagger")]
    #[builder(default = default_stagger())]
    pub stagger_secs: u64,
}

/// 关键词来源
#[derive(Debug, Deserialize, Builder, Clone)]
pub struct KeywordsConfig {
    #[serde(default = "default_keywords_path")]
    #[builder(default = default_keywords_path())]
    pub path: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for SingboxConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for KeywordsConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

fn default_cache_path() -> String {
    "cache".to_string()
}
fn default_bin_path() -> String {
    "bin".to_string()
}
fn default_true() -> bool {
    true
}
fn default_proxy_port() -> u16 {
    7890
}
fn default_api_port() -> u16 {
    9090
}
fn default_selector() -> String {
    "proxy_selector".to_string()
}
fn default_idle_outbound() -> String {
    "block".to_string()
}
fn default_health_url() -> String {
    "https://ipinfo.io/json".to_string()
}
fn default_health_timeout() -> u64 {
    10
}
fn default_local_address() -> Vec<String> {
    vec!["10.14.0.2/16".to_string()]
}
fn default_wireguard_port() -> u16 {
    51820
}
fn default_site() -> String {
    "youtube".to_string()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    1_000
}
fn default_retry_max_ms() -> u64 {
    4_000
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_cooldown_base() -> u64 {
    2
}
fn default_cooldown_max() -> u64 {
    30
}
fn default_rotation_attempts() -> u32 {
    3
}
fn default_run_budget() -> u64 {
    480
}
fn default_search_filter() -> String {
    "CAISBAgBEAE=".to_string()
}
fn default_max_items() -> usize {
    1000
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string()
}
fn default_dedup_ttl() -> u64 {
    86_400
}
fn default_cache_timeout() -> u64 {
    10
}
fn default_instances() -> u32 {
    3
}
fn default_cycle() -> u64 {
    600
}
fn default_stagger() -> u64 {
    180
}
fn default_keywords_path() -> String {
    "keywords.toml".to_string()
}

impl SingboxConfig {
    /// 派生指定实例的端口配置
    pub fn for_instance(&self, instance: u32) -> SingboxConfig {
        let offset = instance.saturating_sub(1) as u16;
        SingboxConfig {
            proxy_port: self.proxy_port.saturating_add(offset),
            api_port: self.api_port.saturating_add(offset),
            ..self.clone()
        }
    }

    pub fn proxy_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.proxy_port)
    }
}

impl CollectorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn run_budget(&self) -> Duration {
        Duration::from_secs(self.run_budget_secs)
    }
}

impl SchedulerConfig {
    /// 实例在周期内的启动偏移 (实例编号从 1 开始)
    pub fn offset_for(&self, instance: u32) -> Duration {
        Duration::from_secs(self.stagger_secs * instance.saturating_sub(1) as u64)
    }
}

impl AppConfig {
    /// 从文件系统与环境变量加载并解析配置
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.unwrap_or_else(|| Path::new("config.toml"));
        let builder = Config::builder();

        let builder = if config_path.exists() {
            builder.add_source(File::from(config_path))
        } else {
            builder
        };

        let settings = builder
            .add_source(
                Environment::with_prefix("TRENDSCOUT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(CollectError::Config)?;

        let config: AppConfig = settings.try_deserialize().map_err(CollectError::Config)?;
        config.validate()?;
        Ok(config)
    }

    /// 校验跨字段约束
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(CollectError::Config(ConfigError::Message(msg)));

        if self.scheduler.instances == 0 {
            return invalid("scheduler.instances must be at least 1".into());
        }
        if self.collector.max_attempts == 0 {
            return invalid("collector.max_attempts must be at least 1".into());
        }
        if self.collector.failure_threshold == 0 {
            return invalid("collector.failure_threshold must be at least 1".into());
        }
        let last_offset = self.scheduler.offset_for(self.scheduler.instances);
        if last_offset.as_secs() >= self.scheduler.cycle_secs {
            return invalid(format!(
                "stagger of {}s for {} instances does not fit in a {}s cycle",
                self.scheduler.stagger_secs, self.scheduler.instances, self.scheduler.cycle_secs
            ));
        }
        if self.collector.run_budget_secs > self.scheduler.cycle_secs {
            return invalid(format!(
                "collector.run_budget_secs ({}) exceeds the cycle length ({})",
                self.collector.run_budget_secs, self.scheduler.cycle_secs
            ));
        }
        Ok(())
    }

    /// 实例专属的 sing-box 工作目录
    pub fn instance_cache_dir(&self, instance: u32) -> std::path::PathBuf {
        Path::new(&self.cache_path).join(format!("instance_{}", instance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_collection_cycle() {
        let config = AppConfig::builder().build();
        assert_eq!(config.cache_path, "cache");
        assert_eq!(config.collector.max_attempts, 3);
        assert_eq!(config.collector.request_timeout_secs, 30);
        assert_eq!(config.dedup.ttl_secs, 86_400);
        assert_eq!(config.scheduler.instances, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn instance_ports_are_offset() {
        let base = SingboxConfig::builder().proxy_port(7000).api_port(9000).build();
        let third = base.for_instance(3);
        assert_eq!(third.proxy_port, 7002);
        assert_eq!(third.api_port, 9002);
        assert_eq!(third.proxy_url(), "http://127.0.0.1:7002");
    }

    #[test]
    fn stagger_offsets_start_at_zero() {
        let scheduler = SchedulerConfig::default();
        assert_eq!(scheduler.offset_for(1).as_secs(), 0);
        assert_eq!(scheduler.offset_for(2).as_secs(), 180);
        assert_eq!(scheduler.offset_for(3).as_secs(), 360);
    }

    #[test]
    fn rejects_stagger_overflowing_cycle() {
        let config = AppConfig::builder()
            .scheduler(
                SchedulerConfig::builder()
                    .instances(5)
                    .stagger_secs(200)
                    .build(),
            )
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
cache_path = "/var/lib/trendscout"

[collector]
max_attempts = 5
title_filter = "all_words"

[[endpoints]]
address = "us-nyc.prod.surfshark.com"
public_key = "Ik9pPCyMJKno1RVHnf+4HhqT8se3kfWJZL7EqVEN5Xk="

[[endpoints]]
address = "us-lax.prod.surfshark.com"
"#,
        )
        .unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.cache_path, "/var/lib/trendscout");
        assert_eq!(config.collector.max_attempts, 5);
        assert_eq!(config.collector.title_filter, TitleFilterMode::AllWords);
        assert_eq!(config.collector.retry_base_ms, 1_000);
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.endpoints[0].server_port, 51820);
    }
}

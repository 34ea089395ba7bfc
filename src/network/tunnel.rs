//! 隧道池 (Tunnel Pool)
//!
//! 每个采集实例独占一个隧道池，按健康度选择出口、在失败后轮换并对故障节点做退避冷却。
//! 池是普通的拥有型值，由 Worker 以 `&mut` 借用驱动，不存在跨任务共享。

use std::cmp::Reverse;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::config::CollectorConfig;
use crate::core::error::{CollectError, Result};
use crate::interfaces::TunnelControl;
use crate::utils::save_file;

/// 节点健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HealthState {
    Untested,
    Working,
    Failed,
    CoolingDown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub state: HealthState,
    pub last_used_at: Option<DateTime<Utc>>,
    /// 最近一次成功的时间，用于在 working 节点之间排序
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl Endpoint {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            state: HealthState::Untested,
            last_used_at: None,
            last_success_at: None,
            consecutive_failures: 0,
            cooldown_until: None,
        }
    }
}

/// 健康度与轮换参数
#[derive(Debug, Clone, Builder)]
pub struct PoolPolicy {
    #[builder(default = 3)]
    pub failure_threshold: u32,
    #[builder(default = Duration::from_secs(2))]
    pub cooldown_base: Duration,
    #[builder(default = Duration::from_secs(30))]
    pub cooldown_max: Duration,
    #[builder(default = 3)]
    pub max_rotation_attempts: u32,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl From<&CollectorConfig> for PoolPolicy {
    fn from(config: &CollectorConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            cooldown_base: Duration::from_secs(config.cooldown_base_secs),
            cooldown_max: Duration::from_secs(config.cooldown_max_secs),
            max_rotation_attempts: config.max_rotation_attempts,
        }
    }
}

impl PoolPolicy {
    /// `min(max, base * 2^failures)`
    pub fn cooldown(&self, consecutive_failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(consecutive_failures);
        self.cooldown_base.saturating_mul(factor).min(self.cooldown_max)
    }
}

pub struct TunnelPool {
    endpoints: Vec<Endpoint>,
    active: Option<usize>,
    control: Arc<dyn TunnelControl>,
    policy: PoolPolicy,
    used: Vec<String>,
    failed: Vec<String>,
}

impl TunnelPool {
    pub fn new(addresses: Vec<String>, control: Arc<dyn TunnelControl>, policy: PoolPolicy) -> Self {
        let mut endpoints: Vec<Endpoint> = Vec::with_capacity(addresses.len());
        for address in addresses {
            if endpoints.iter().any(|e| e.address == address) {
                continue;
            }
            endpoints.push(Endpoint::new(address));
        }
        Self {
            endpoints,
            active: None,
            control,
            policy,
            used: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn active(&self) -> Option<&str> {
        self.active.map(|i| self.endpoints[i].address.as_str())
    }

    pub fn state_of(&self, address: &str) -> Option<HealthState> {
        self.endpoints.iter().find(|e| e.address == address).map(|e| e.state)
    }

    /// 本轮使用过的节点 (按首次使用顺序)
    pub fn tunnels_used(&self) -> Vec<String> {
        self.used.clone()
    }

    /// 本轮被判定为 failed 的节点
    pub fn failed_tunnels(&self) -> Vec<String> {
        self.failed.clone()
    }

    pub fn select_endpoint(&mut self) -> Result<String> {
        self.select_endpoint_at(Utc::now())
    }

    /// 选择下一个可用节点：working 优先 (最近成功者在前)，其次按池顺序选 untested
    pub fn select_endpoint_at(&mut self, now: DateTime<Utc>) -> Result<String> {
        self.refresh(now);
        match self.pick(&[]) {
            Some(i) => Ok(self.endpoints[i].address.clone()),
            None => Err(self.exhausted()),
        }
    }

    pub fn report_outcome(&mut self, address: &str, success: bool) {
        self.report_outcome_at(address, success, Utc::now());
    }

    /// 记录一次使用结果
    ///
    /// 连续失败计数只在成功时清零。冷却结束重新变为 untested 的节点保留原计数，
    /// 因此再失败一次就会回到 failed，且冷却时间按更高的计数继续翻倍 (上限 `cooldown_max`)。
    pub fn report_outcome_at(&mut self, address: &str, success: bool, now: DateTime<Utc>) {
        let Some(endpoint) = self.endpoints.iter_mut().find(|e| e.address == address) else {
            warn!(endpoint = address, "忽略未知节点的结果报告");
            return;
        };

        endpoint.last_used_at = Some(now);
        if success {
            if endpoint.state != HealthState::Working {
                info!(endpoint = address, from = %endpoint.state, "节点状态 -> working");
            }
            endpoint.state = HealthState::Working;
            endpoint.consecutive_failures = 0;
            endpoint.last_success_at = Some(now);
            endpoint.cooldown_until = None;
            return;
        }

        endpoint.consecutive_failures = endpoint.consecutive_failures.saturating_add(1);
        debug!(
            endpoint = address,
            failures = endpoint.consecutive_failures,
            "节点失败计数增加"
        );
        if endpoint.consecutive_failures >= self.policy.failure_threshold
            && matches!(endpoint.state, HealthState::Working | HealthState::Untested)
        {
            let cooldown = self.policy.cooldown(endpoint.consecutive_failures);
            endpoint.state = HealthState::Failed;
            endpoint.cooldown_until = chrono::Duration::from_std(cooldown).ok().map(|d| now + d);
            warn!(
                endpoint = address,
                failures = endpoint.consecutive_failures,
                cooldown_secs = cooldown.as_secs(),
                "节点状态 -> failed"
            );
            if !self.failed.iter().any(|a| a == address) {
                self.failed.push(address.to_string());
            }
        }
    }

    /// 返回当前活动节点；没有时执行一次轮换
    pub async fn ensure_connected(&mut self) -> Result<String> {
        match self.active() {
            Some(address) => Ok(address.to_string()),
            None => self.rotate().await,
        }
    }

    /// 断开当前节点并连接下一个健康节点
    ///
    /// 连接后必须通过健康检查才算建立；在有限次数内仍未成功则返回 `TunnelExhausted`。
    pub async fn rotate(&mut self) -> Result<String> {
        let previous = self.active.take();
        if let Some(i) = previous {
            debug!(endpoint = %self.endpoints[i].address, "断开当前节点");
            if let Err(e) = self.control.disconnect().await {
                warn!("断开节点失败: {}", e);
            }
        }

        let mut tried: Vec<usize> = Vec::new();
        for attempt in 1..=self.policy.max_rotation_attempts {
            self.refresh(Utc::now());

            // 尽量避开刚刚放弃的节点，除非它是唯一候选
            let mut avoid = tried.clone();
            avoid.extend(previous);
            let Some(idx) = self.pick(&avoid).or_else(|| self.pick(&tried)) else {
                break;
            };
            tried.push(idx);

            let address = self.endpoints[idx].address.clone();
            info!(endpoint = %address, attempt, "正在切换隧道节点...");
            self.note_used(&address);

            let verified = match self.control.connect(&address).await {
                Ok(()) => match self.control.health_check().await {
                    Ok(true) => true,
                    Ok(false) => {
                        warn!(endpoint = %address, "节点健康检查未通过");
                        false
                    }
                    Err(e) => {
                        warn!(endpoint = %address, "节点健康检查失败: {}", e);
                        false
                    }
                },
                Err(e) => {
                    warn!(endpoint = %address, "连接节点失败: {}", e);
                    false
                }
            };

            if verified {
                self.active = Some(idx);
                return Ok(address);
            }
            self.report_outcome(&address, false);
        }

        Err(self.exhausted())
    }

    /// 断开出口 (运行结束时调用)
    ///
    /// 无论是否有活动节点都会通知控制端：轮换可能在 `connect` 成功、健康检查完成之前
    /// 被取消，此时控制端已切到新节点而池内 `active` 仍为空。
    pub async fn release(&mut self) {
        self.active = None;
        if let Err(e) = self.control.disconnect().await {
            warn!("断开节点失败: {}", e);
        }
    }

    /// 从缓存目录恢复上一轮运行的健康状态
    ///
    /// 文件中不存在于当前池的地址会被忽略，新地址保持 untested。
    pub fn restore(&mut self, path: &Path) {
        let Ok(json) = std::fs::read_to_string(path) else {
            return;
        };
        let saved: Vec<Endpoint> = match serde_json::from_str(&json) {
            Ok(saved) => saved,
            Err(e) => {
                warn!(path = %path.display(), "隧道状态文件损坏，已忽略: {}", e);
                return;
            }
        };

        let mut restored = 0;
        for entry in saved {
            if let Some(endpoint) = self.endpoints.iter_mut().find(|e| e.address == entry.address) {
                *endpoint = entry;
                restored += 1;
            }
        }
        debug!("加载缓存的隧道状态 ({} 条记录)", restored);
    }

    pub async fn persist(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.endpoints)?;
        save_file(path, &json).await?;
        debug!("隧道状态已保存");
        Ok(())
    }

    /// 推进时间相关的状态：非活动的 failed 节点进入冷却，冷却到期的节点恢复为 untested
    fn refresh(&mut self, now: DateTime<Utc>) {
        for (i, endpoint) in self.endpoints.iter_mut().enumerate() {
            if endpoint.state == HealthState::Failed && self.active != Some(i) {
                endpoint.state = HealthState::CoolingDown;
            }
            if endpoint.state == HealthState::CoolingDown
                && endpoint.cooldown_until.is_none_or(|until| until <= now)
            {
                info!(endpoint = %endpoint.address, "冷却结束，节点状态 -> untested");
                endpoint.state = HealthState::Untested;
                endpoint.cooldown_until = None;
            }
        }
    }

    fn pick(&self, skip: &[usize]) -> Option<usize> {
        let working = self
            .candidates(skip)
            .filter(|(_, e)| e.state == HealthState::Working)
            .max_by_key(|(i, e)| (e.last_success_at, Reverse(*i)))
            .map(|(i, _)| i);
        working.or_else(|| {
            self.candidates(skip)
                .find(|(_, e)| e.state == HealthState::Untested)
                .map(|(i, _)| i)
        })
    }

    fn candidates<'a>(&'a self, skip: &'a [usize]) -> impl Iterator<Item = (usize, &'a Endpoint)> + 'a {
        self.endpoints
            .iter()
            .enumerate()
            .filter(move |(i, _)| !skip.contains(i))
    }

    fn note_used(&mut self, address: &str) {
        if !self.used.iter().any(|a| a == address) {
            self.used.push(address.to_string());
        }
    }

    fn exhausted(&self) -> CollectError {
        let count = |state| self.endpoints.iter().filter(|e| e.state == state).count();
        CollectError::TunnelExhausted(format!(
            "{} endpoints: {} failed, {} cooling down, {} unverified",
            self.endpoints.len(),
            count(HealthState::Failed),
            count(HealthState::CoolingDown),
            count(HealthState::Untested) + count(HealthState::Working),
        ))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashSet;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use parking_lot::Mutex;

    use super::*;

    /// 记录调用并按地址注入故障的隧道控制
    #[derive(Default)]
    pub(crate) struct FakeControl {
        pub broken: Mutex<HashSet<String>>,
        pub current: Mutex<Option<String>>,
        pub connects: Mutex<Vec<String>>,
        /// 健康检查耗时，用于模拟轮换中途被取消
        pub health_delay: Option<Duration>,
    }

    impl FakeControl {
        pub fn breaking(addresses: &[&str]) -> Arc<Self> {
            let control = Self::default();
            control.broken.lock().extend(addresses.iter().map(|a| a.to_string()));
            Arc::new(control)
        }
    }

    #[async_trait]
    impl TunnelControl for FakeControl {
        async fn connect(&self, address: &str) -> Result<()> {
            self.connects.lock().push(address.to_string());
            *self.current.lock() = Some(address.to_string());
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            *self.current.lock() = None;
            Ok(())
        }

        async fn health_check(&self) -> Result<bool> {
            if let Some(delay) = self.health_delay {
                tokio::time::sleep(delay).await;
            }
            let current = self.current.lock().clone();
            Ok(current.is_some_and(|c| !self.broken.lock().contains(&c)))
        }
    }

    fn pool(addresses: &[&str], control: Arc<FakeControl>) -> TunnelPool {
        TunnelPool::new(
            addresses.iter().map(|a| a.to_string()).collect(),
            control,
            PoolPolicy::default(),
        )
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn cooldown_doubles_up_to_cap() {
        let policy = PoolPolicy::default();
        assert_eq!(policy.cooldown(0), Duration::from_secs(2));
        assert_eq!(policy.cooldown(3), Duration::from_secs(16));
        assert_eq!(policy.cooldown(4), Duration::from_secs(30));
        assert_eq!(policy.cooldown(40), Duration::from_secs(30));
    }

    #[test]
    fn three_failures_exclude_endpoint_until_cooldown_elapses() {
        let mut pool = pool(&["a", "b"], Arc::new(FakeControl::default()));
        let now = t0();

        pool.report_outcome_at("a", false, now);
        pool.report_outcome_at("a", false, now);
        assert_eq!(pool.state_of("a"), Some(HealthState::Untested));
        pool.report_outcome_at("a", false, now);
        assert_eq!(pool.state_of("a"), Some(HealthState::Failed));
        assert_eq!(pool.failed_tunnels(), vec!["a".to_string()]);

        // 冷却期内不可选
        assert_eq!(pool.select_endpoint_at(now).unwrap(), "b");
        assert_eq!(pool.state_of("a"), Some(HealthState::CoolingDown));
        assert_eq!(
            pool.select_endpoint_at(now + chrono::Duration::seconds(15)).unwrap(),
            "b"
        );

        // 2s * 2^3 = 16s 之后恢复为 untested
        pool.report_outcome_at("b", false, now);
        pool.report_outcome_at("b", false, now);
        pool.report_outcome_at("b", false, now);
        let later = now + chrono::Duration::seconds(16);
        assert_eq!(pool.select_endpoint_at(later).unwrap(), "a");
        assert_eq!(pool.state_of("a"), Some(HealthState::Untested));
        // 失败计数保留到下一次成功
        assert_eq!(pool.endpoints()[0].consecutive_failures, 3);
    }

    #[test]
    fn none_available_when_everything_cools_down() {
        let mut pool = pool(&["a"], Arc::new(FakeControl::default()));
        for _ in 0..3 {
            pool.report_outcome_at("a", false, t0());
        }
        let err = pool.select_endpoint_at(t0()).unwrap_err();
        assert!(matches!(err, CollectError::TunnelExhausted(_)));
    }

    #[test]
    fn working_endpoints_preferred_most_recent_first() {
        let mut pool = pool(&["a", "b", "c"], Arc::new(FakeControl::default()));
        pool.report_outcome_at("b", true, t0());
        pool.report_outcome_at("c", true, t0() + chrono::Duration::seconds(5));
        assert_eq!(pool.select_endpoint_at(t0()).unwrap(), "c");

        pool.report_outcome_at("b", true, t0() + chrono::Duration::seconds(9));
        assert_eq!(pool.select_endpoint_at(t0()).unwrap(), "b");
    }

    #[test]
    fn success_resets_failure_count() {
        let mut pool = pool(&["a"], Arc::new(FakeControl::default()));
        pool.report_outcome_at("a", false, t0());
        pool.report_outcome_at("a", false, t0());
        pool.report_outcome_at("a", true, t0());
        pool.report_outcome_at("a", false, t0());
        assert_eq!(pool.state_of("a"), Some(HealthState::Working));
        assert_eq!(pool.endpoints()[0].consecutive_failures, 1);
    }

    #[tokio::test]
    async fn rotate_skips_endpoints_failing_health_check() {
        let control = FakeControl::breaking(&["a"]);
        let mut pool = pool(&["a", "b"], control.clone());

        let active = pool.rotate().await.unwrap();
        assert_eq!(active, "b");
        assert_eq!(pool.active(), Some("b"));
        assert_eq!(*control.connects.lock(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(pool.endpoints()[0].consecutive_failures, 1);
        assert_eq!(pool.tunnels_used(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn rotate_moves_away_from_previous_endpoint() {
        let control = Arc::new(FakeControl::default());
        let mut pool = pool(&["a", "b"], control.clone());

        assert_eq!(pool.ensure_connected().await.unwrap(), "a");
        assert_eq!(pool.ensure_connected().await.unwrap(), "a");
        assert_eq!(pool.rotate().await.unwrap(), "b");
        // 只剩一个候选时允许重连原节点
        let mut single = super::TunnelPool::new(vec!["x".into()], control, PoolPolicy::default());
        single.rotate().await.unwrap();
        assert_eq!(single.rotate().await.unwrap(), "x");
    }

    #[tokio::test]
    async fn rotate_surfaces_exhaustion() {
        let control = FakeControl::breaking(&["a", "b", "c", "d"]);
        let mut pool = pool(&["a", "b", "c", "d"], control.clone());

        let err = pool.rotate().await.unwrap_err();
        assert!(matches!(err, CollectError::TunnelExhausted(_)));
        // 单次轮换最多尝试 3 个节点
        assert_eq!(control.connects.lock().len(), 3);
        assert_eq!(pool.active(), None);
    }

    #[test]
    fn readmitted_endpoint_fails_again_with_longer_cooldown() {
        let mut pool = pool(&["a"], Arc::new(FakeControl::default()));
        let now = t0();
        for _ in 0..3 {
            pool.report_outcome_at("a", false, now);
        }
        let readmitted = now + chrono::Duration::seconds(16);
        assert_eq!(pool.select_endpoint_at(readmitted).unwrap(), "a");

        pool.report_outcome_at("a", false, readmitted);
        assert_eq!(pool.state_of("a"), Some(HealthState::Failed));
        // 2s * 2^4 = 32s，受 30s 上限约束
        assert_eq!(
            pool.endpoints()[0].cooldown_until,
            Some(readmitted + chrono::Duration::seconds(30))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn release_disconnects_after_interrupted_rotation() {
        let control = Arc::new(FakeControl {
            health_delay: Some(Duration::from_secs(5)),
            ..FakeControl::default()
        });
        let mut pool = pool(&["a"], control.clone());

        let interrupted = tokio::time::timeout(Duration::from_secs(1), pool.rotate()).await;
        assert!(interrupted.is_err());
        assert_eq!(pool.active(), None);
        assert_eq!(*control.current.lock(), Some("a".to_string()));

        pool.release().await;
        assert_eq!(*control.current.lock(), None);
    }

    #[tokio::test]
    async fn state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunnel_state_instance_1.json");

        let mut first = pool(&["a", "b"], Arc::new(FakeControl::default()));
        for _ in 0..3 {
            first.report_outcome_at("a", false, Utc::now());
        }
        first.report_outcome_at("b", true, Utc::now());
        first.persist(&path).await.unwrap();

        let mut second = pool(&["b", "a", "new"], Arc::new(FakeControl::default()));
        second.restore(&path);
        assert_eq!(second.state_of("a"), Some(HealthState::Failed));
        assert_eq!(second.state_of("b"), Some(HealthState::Working));
        assert_eq!(second.state_of("new"), Some(HealthState::Untested));
        assert_eq!(second.select_endpoint().unwrap(), "b");
        assert_eq!(second.state_of("a"), Some(HealthState::CoolingDown));
    }
}

//! Worker 运行时上下文 (Runtime Context)
//!
//! 聚合单个实例运行期间所需的全部协作方。隧道池不在其中：它是可变的拥有型状态，
//! 由调用方以 `&mut` 单独传入。

use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use tokio_util::sync::CancellationToken;

use crate::engine::dedup::DedupGate;
use crate::engine::retry::RetryPolicy;
use crate::interfaces::{Fetcher, ItemStore, RunLogSink, SearchSite};

#[derive(Builder)]
pub struct WorkerContext {
    /// 实例编号 (从 1 开始)，决定去重命名空间
    pub instance_id: u32,
    pub site: Arc<dyn SearchSite>,
    pub fetcher: Arc<dyn Fetcher>,
    pub dedup: DedupGate,
    pub store: Arc<dyn ItemStore>,
    pub log_sink: Arc<dyn RunLogSink>,
    #[builder(default)]
    pub retry: RetryPolicy,
    #[builder(default = Duration::from_secs(86_400))]
    pub dedup_ttl: Duration,
    /// 整轮运行的墙钟预算
    #[builder(default = Duration::from_secs(480))]
    pub budget: Duration,
    /// 外部关闭信号 (Ctrl-C)
    #[builder(default)]
    pub shutdown: CancellationToken,
}

//! 多实例调度器
//!
//! 关键词与出口节点按同一个确定性函数切分给 N 个实例；各实例在周期内错峰启动，
//! 以独立子进程运行，互不共享隧道与去重命名空间。

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::config::SchedulerConfig;
use crate::core::model::{Keyword, RunRecord};

/// 分区前的关键词预处理
///
/// 只保留启用项，按 ID 去重，再按小写文本 (其次 ID) 排序。排序让 "grok" 与 "grok 3"
/// 这类重叠短语相邻，通常落在同一实例，减少跨实例重复采集。
pub fn prepare_keywords(keywords: Vec<Keyword>) -> Vec<Keyword> {
    let mut seen = HashSet::new();
    let mut prepared: Vec<Keyword> = keywords
        .into_iter()
        .filter(|k| k.active)
        .filter(|k| seen.insert(k.id.clone()))
        .collect();
    prepared.sort_by(|a, b| {
        a.display_text
            .to_lowercase()
            .cmp(&b.display_text.to_lowercase())
            .then_with(|| a.id.cmp(&b.id))
    });
    prepared
}

/// 连续均衡切分：各分片大小相差不超过 1，靠前的分片优先多分一个
///
/// 16 个元素分 3 份得到 6 / 5 / 5。输入相同则结果相同。
pub fn partition<T: Clone>(items: &[T], parts: usize) -> Vec<Vec<T>> {
    if parts == 0 {
        return Vec::new();
    }
    let base = items.len() / parts;
    let extra = items.len() % parts;

    let mut chunks = Vec::with_capacity(parts);
    let mut start = 0;
    for i in 0..parts {
        let len = base + usize::from(i < extra);
        chunks.push(items[start..start + len].to_vec());
        start += len;
    }
    chunks
}

/// 取出指定实例 (从 1 开始) 的分片
pub fn assignment_for<T: Clone>(items: &[T], instances: u32, instance: u32) -> Vec<T> {
    if instance == 0 || instance > instances {
        return Vec::new();
    }
    partition(items, instances as usize)
        .into_iter()
        .nth(instance as usize - 1)
        .unwrap_or_default()
}

/// 各实例的启动偏移
pub fn stagger_offsets(config: &SchedulerConfig) -> Vec<(u32, Duration)> {
    (1..=config.instances)
        .map(|i| (i, config.offset_for(i)))
        .collect()
}

/// 生成供外部 cron 使用的错峰调度行
pub fn crontab_lines(
    config: &SchedulerConfig,
    exe: &str,
    config_path: Option<&str>,
    log_dir: &str,
) -> anyhow::Result<Vec<String>> {
    if config.cycle_secs % 60 != 0 || config.stagger_secs % 60 != 0 {
        bail!("cron scheduling needs whole-minute cycle and stagger values");
    }
    let cycle_min = config.cycle_secs / 60;
    if cycle_min == 0 || 60 % cycle_min != 0 {
        bail!("cycle of {} minutes does not divide an hour", cycle_min);
    }

    let config_arg = config_path
        .map(|p| format!(" --config {}", p))
        .unwrap_or_default();

    Ok(stagger_offsets(config)
        .into_iter()
        .map(|(instance, offset)| {
            let offset_min = offset.as_secs() / 60;
            let minute = if offset_min == 0 {
                format!("*/{}", cycle_min)
            } else {
                format!("{}-59/{}", offset_min, cycle_min)
            };
            format!(
                "{minute} * * * * {exe}{config_arg} collect --instance {instance} >> {log_dir}/collector_instance_{instance}.log 2>&1"
            )
        })
        .collect())
}

/// 单个实例的启动方式
#[async_trait]
pub trait InstanceLauncher: Send + Sync {
    async fn launch(&self, instance: u32) -> anyhow::Result<RunRecord>;
}

/// 以子进程方式运行当前程序的 `collect` 子命令，从 stdout 读取运行记录
pub struct ProcessLauncher {
    exe: PathBuf,
    config_path: Option<PathBuf>,
    timeout: Duration,
}

impl ProcessLauncher {
    pub fn new(exe: PathBuf, config_path: Option<PathBuf>, timeout: Duration) -> Self {
        Self {
            exe,
            config_path,
            timeout,
        }
    }
}

#[async_trait]
impl InstanceLauncher for ProcessLauncher {
    async fn launch(&self, instance: u32) -> anyhow::Result<RunRecord> {
        let mut cmd = Command::new(&self.exe);
        if let Some(path) = &self.config_path {
            cmd.arg("--config").arg(path);
        }
        cmd.arg("collect")
            .arg("--instance")
            .arg(instance.to_string())
            .arg("--emit-summary")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let child = cmd.spawn().context("启动实例进程失败")?;
        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow!("instance {} exceeded {}s", instance, self.timeout.as_secs()))?
            .context("等待实例进程退出失败")?;

        if !output.status.success() {
            bail!("instance {} exited with {}", instance, output.status);
        }
        parse_run_record(&String::from_utf8_lossy(&output.stdout))
    }
}

/// 取 stdout 最后一个非空行作为运行记录
fn parse_run_record(stdout: &str) -> anyhow::Result<RunRecord> {
    let line = stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| anyhow!("instance produced no run record"))?;
    serde_json::from_str(line).context("无法解析实例运行记录")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InstanceOutcome {
    Completed { record: RunRecord },
    Crashed { detail: String },
    /// 周期内收到关闭信号，未启动
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceReport {
    pub instance_id: u32,
    pub offset_secs: u64,
    #[serde(flatten)]
    pub outcome: InstanceOutcome,
}

/// 一个调度周期的汇总
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub keywords_attempted: usize,
    pub keywords_succeeded: usize,
    pub keywords_failed: usize,
    pub items_collected: usize,
    pub success_rate: f64,
    pub crashed_instances: Vec<u32>,
    pub instances: Vec<InstanceReport>,
}

impl CycleSummary {
    pub fn from_reports(
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        mut instances: Vec<InstanceReport>,
    ) -> Self {
        instances.sort_by_key(|r| r.instance_id);
        let records = || {
            instances.iter().filter_map(|r| match &r.outcome {
                InstanceOutcome::Completed { record } => Some(record),
                _ => None,
            })
        };

        let keywords_attempted: usize = records().map(|r| r.keywords_attempted).sum();
        let keywords_succeeded: usize = records().map(|r| r.keywords_succeeded).sum();
        let keywords_failed: usize = records().map(|r| r.keywords_failed).sum();
        let items_collected: usize = records().map(|r| r.items_collected).sum();
        let crashed_instances = instances
            .iter()
            .filter(|r| matches!(r.outcome, InstanceOutcome::Crashed { .. }))
            .map(|r| r.instance_id)
            .collect();

        Self {
            started_at,
            finished_at,
            keywords_attempted,
            keywords_succeeded,
            keywords_failed,
            items_collected,
            success_rate: if keywords_attempted == 0 {
                0.0
            } else {
                keywords_succeeded as f64 / keywords_attempted as f64
            },
            crashed_instances,
            instances,
        }
    }
}

/// 执行一个完整周期：按偏移错峰启动全部实例并等待其结束
///
/// 单个实例崩溃只记录在汇总中，不影响其他实例。
pub async fn run_cycle(
    launcher: Arc<dyn InstanceLauncher>,
    config: &SchedulerConfig,
    shutdown: CancellationToken,
) -> CycleSummary {
    let started_at = Utc::now();
    info!(instances = config.instances, cycle_secs = config.cycle_secs, "开始调度周期");

    let runs = stagger_offsets(config).into_iter().map(|(instance, offset)| {
        let launcher = launcher.clone();
        let shutdown = shutdown.clone();
        async move {
            let outcome = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                _ = sleep(offset) => Some(()),
            };
            let outcome = match outcome {
                None => {
                    warn!(instance, "收到关闭信号，跳过实例");
                    InstanceOutcome::Skipped
                }
                Some(()) => {
                    info!(instance, offset_secs = offset.as_secs(), "启动实例");
                    match launcher.launch(instance).await {
                        Ok(record) => {
                            info!(
                                instance,
                                succeeded = record.keywords_succeeded,
                                failed = record.keywords_failed,
                                items = record.items_collected,
                                "实例完成"
                            );
                            InstanceOutcome::Completed { record }
                        }
                        Err(e) => {
                            error!(instance, "实例异常退出: {:#}", e);
                            InstanceOutcome::Crashed {
                                detail: format!("{:#}", e),
                            }
                        }
                    }
                }
            };
            InstanceReport {
                instance_id: instance,
                offset_secs: offset.as_secs(),
                outcome,
            }
        }
    });

    let reports = futures::future::join_all(runs).await;
    let summary = CycleSummary::from_reports(started_at, Utc::now(), reports);
    info!(
        items = summary.items_collected,
        crashed = summary.crashed_instances.len(),
        "调度周期结束"
    );
    summary
}

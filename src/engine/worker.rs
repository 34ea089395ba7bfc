//! 采集 Worker
//!
//! 按固定顺序逐个处理分配到的关键词。每个关键词独立成败：单个关键词的失败只记录在
//! 运行记录中，不会中断整轮运行；只有隧道耗尽、预算用尽或外部关闭才会提前结束。

use chrono::Utc;
use tokio::time::{Instant, sleep_until};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::core::error::{CollectError, Result};
use crate::core::model::{CandidateItem, Keyword, KeywordError, RunRecord, StopReason, StoredItem};
use crate::engine::context::WorkerContext;
use crate::engine::retry;
use crate::interfaces::UpsertOutcome;
use crate::network::tunnel::TunnelPool;

/// 关键词处理阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum KeywordStage {
    Pending,
    Fetching,
    Parsing,
    Filtering,
    Deduping,
    Persisting,
    Done,
    Failed,
}

/// 单个关键词的处理进度，失败时用于补全错误记录
#[derive(Debug, Default)]
struct Progress {
    attempts: u32,
    endpoint: Option<String>,
    persisted: usize,
}

/// 执行一轮采集并把运行记录交给日志接收端
pub async fn run(ctx: &WorkerContext, pool: &mut TunnelPool, keywords: &[Keyword]) -> RunRecord {
    let mut record = RunRecord::start(ctx.instance_id, keywords.len(), Utc::now());
    let deadline = Instant::now() + ctx.budget;
    info!(
        instance = ctx.instance_id,
        keywords = keywords.len(),
        endpoints = pool.endpoints().len(),
        budget_secs = ctx.budget.as_secs(),
        "开始采集运行"
    );

    for (index, keyword) in keywords.iter().enumerate() {
        if ctx.shutdown.is_cancelled() {
            record.stop_reason = Some(StopReason::Shutdown);
            break;
        }
        if Instant::now() >= deadline {
            record.stop_reason = Some(StopReason::BudgetExceeded);
            break;
        }

        let span = info_span!("keyword", instance = ctx.instance_id, keyword = %keyword.id);
        let mut progress = Progress::default();
        let outcome = tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => {
                Err(CollectError::Cancelled("shutdown requested".into()))
            }
            _ = sleep_until(deadline) => {
                Err(CollectError::Cancelled("run budget exhausted".into()))
            }
            result = process_keyword(ctx, pool, keyword, &mut progress).instrument(span.clone()) => result,
        };

        let _entered = span.enter();
        match outcome {
            Ok(items) => {
                info!(
                    stage = %KeywordStage::Done,
                    items,
                    progress = %format_args!("{}/{}", index + 1, keywords.len()),
                    "关键词采集完成"
                );
                record.record_success(items);
            }
            Err(e) => {
                error!(
                    stage = %KeywordStage::Failed,
                    attempts = progress.attempts,
                    endpoint = progress.endpoint.as_deref().unwrap_or("-"),
                    "关键词采集失败: {}",
                    e
                );
                let stop = e
                    .is_fatal()
                    .then(|| stop_reason(&e, ctx.shutdown.is_cancelled()));
                record.record_failure(
                    KeywordError {
                        keyword_id: keyword.id.clone(),
                        keyword: keyword.display_text.clone(),
                        attempts: progress.attempts,
                        endpoint: progress.endpoint.clone(),
                        error: e.to_string(),
                    },
                    progress.persisted,
                );
                if stop.is_some() {
                    record.stop_reason = stop;
                    break;
                }
            }
        }
    }

    record.finalize(Utc::now(), pool.tunnels_used(), pool.failed_tunnels());
    match &record.stop_reason {
        Some(reason) => warn!(
            instance = ctx.instance_id,
            reason = ?reason,
            skipped = record.keywords_assigned - record.keywords_attempted,
            "运行提前结束"
        ),
        None => info!(instance = ctx.instance_id, "所有关键词处理完毕"),
    }
    info!(
        attempted = record.keywords_attempted,
        succeeded = record.keywords_succeeded,
        failed = record.keywords_failed,
        items = record.items_collected,
        success_rate = %format_args!("{:.1}%", record.success_rate * 100.0),
        "运行统计"
    );

    if let Err(e) = ctx.log_sink.record(&record).await {
        error!("写入运行日志失败: {}", e);
    }
    record
}

/// 致命错误对应的提前结束原因
fn stop_reason(error: &CollectError, shutdown_requested: bool) -> StopReason {
    match error {
        CollectError::TunnelExhausted(detail) => StopReason::TunnelExhausted(detail.clone()),
        _ if shutdown_requested => StopReason::Shutdown,
        _ => StopReason::BudgetExceeded,
    }
}

/// 处理单个关键词，返回新写入的条目数
async fn process_keyword(
    ctx: &WorkerContext,
    pool: &mut TunnelPool,
    keyword: &Keyword,
    progress: &mut Progress,
) -> Result<usize> {
    debug!(stage = %KeywordStage::Pending, text = %keyword.display_text);

    let fetched = retry::attempt(&ctx.retry, async |attempt| {
        progress.attempts = attempt;
        let endpoint = pool.ensure_connected().await?;
        progress.endpoint = Some(endpoint.clone());

        debug!(stage = %KeywordStage::Fetching, attempt, endpoint = %endpoint);
        let raw = match ctx.fetcher.fetch(keyword, &endpoint).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(attempt, endpoint = %endpoint, "抓取失败: {}", e);
                if e.penalizes_tunnel() {
                    pool.report_outcome(&endpoint, false);
                    pool.rotate().await?;
                }
                return Err(e);
            }
        };
        pool.report_outcome(&endpoint, true);

        debug!(stage = %KeywordStage::Parsing, attempt, bytes = raw.body.len());
        ctx.site.parse(&raw).inspect_err(|e| warn!(attempt, "解析失败: {}", e))
    })
    .await;
    let candidates = fetched.map_err(|exhausted| exhausted.error)?;

    debug!(stage = %KeywordStage::Filtering, candidates = candidates.len());
    let relevant: Vec<CandidateItem> = candidates
        .into_iter()
        .filter(|c| ctx.site.matches(c, keyword))
        .collect();

    debug!(stage = %KeywordStage::Deduping, relevant = relevant.len());
    let mut duplicates = 0;
    for candidate in relevant {
        if ctx.dedup.seen(ctx.instance_id, &candidate.external_id).await {
            duplicates += 1;
            continue;
        }
        ctx.dedup
            .mark_seen(ctx.instance_id, &candidate.external_id, ctx.dedup_ttl)
            .await;

        let stored = StoredItem::new(candidate.into_item(&keyword.id, Utc::now(), ctx.site.id()));
        debug!(stage = %KeywordStage::Persisting, document = %stored.document_id);
        let outcome = retry::attempt(&ctx.retry, async |_| ctx.store.upsert(&stored).await)
            .await
            .map_err(|exhausted| exhausted.error)?;
        if outcome == UpsertOutcome::Inserted {
            progress.persisted += 1;
        }
    }

    debug!(new = progress.persisted, duplicates, "去重与持久化完成");
    Ok(progress.persisted)
}

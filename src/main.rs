//! 应用程序入口 (Application Entrypoint)
//!
//! 负责 CLI 指令解析、遥测层初始化、依赖注入及系统生命周期管理。
//! 日志统一写入 stderr，stdout 只承载机器可读的运行记录 / 周期汇总。

mod core;
mod engine;
mod interfaces;
mod network;
mod sites;
mod storage;
mod utils;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::core::config::AppConfig;
use crate::engine::CollectorEngine;
use crate::engine::scheduler::{ProcessLauncher, crontab_lines, run_cycle};

/// 命令行界面脚手架 (CLI Scaffolding)
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// 配置文件路径 (默认 ./config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 运行单个实例的一轮采集
    Collect {
        /// 实例编号 (从 1 开始)
        #[arg(short, long)]
        instance: u32,
        /// 结束时向 stdout 输出单行 JSON 运行记录
        #[arg(long)]
        emit_summary: bool,
    },
    /// 在一个周期内错峰启动全部实例并汇总结果
    Cycle,
    /// 打印关键词在各实例间的分配
    Partition,
    /// 打印供 cron 使用的错峰调度行
    Schedule {
        /// 写入 crontab 的可执行文件路径 (默认当前程序)
        #[arg(long)]
        exe: Option<PathBuf>,
        /// 实例日志目录
        #[arg(long, default_value = "logs")]
        log_dir: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 遥测层初始化 (Telemetry Layer Initialization)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = Arc::new(AppConfig::load(cli.config.as_deref()).context("配置加载失败")?);

    // 信号处理与优雅退出 (Signal Handling)
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("收到中断信号，正在结束当前关键词...");
            signal_token.cancel();
        }
    });

    match cli.command {
        Commands::Collect {
            instance,
            emit_summary,
        } => {
            let engine = CollectorEngine::new(config.clone());
            let record = engine.collect(instance, shutdown).await.inspect_err(|e| {
                error!(instance, "采集运行失败: {:#}", e);
            })?;
            if emit_summary {
                println!("{}", serde_json::to_string(&record)?);
            } else {
                println!("{}", serde_json::to_string_pretty(&record)?);
            }
        }
        Commands::Cycle => {
            let exe = std::env::current_exe().context("无法定位当前可执行文件")?;
            // 单个实例最多运行到周期结束
            let launcher = Arc::new(ProcessLauncher::new(
                exe,
                cli.config.clone(),
                Duration::from_secs(config.scheduler.cycle_secs),
            ));
            let summary = run_cycle(launcher, &config.scheduler, shutdown).await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Partition => {
            let engine = CollectorEngine::new(config.clone());
            for (instance, keywords) in engine.plan().await? {
                let offset = config.scheduler.offset_for(instance).as_secs();
                println!(
                    "instance {} (+{}s): {} keywords",
                    instance,
                    offset,
                    keywords.len()
                );
                for kw in keywords {
                    println!("  {:<24} {}", kw.id, kw.display_text);
                }
            }
        }
        Commands::Schedule { exe, log_dir } => {
            let exe = match exe {
                Some(path) => path,
                None => std::env::current_exe().context("无法定位当前可执行文件")?,
            };
            let config_path = cli.config.as_ref().map(|p| p.display().to_string());
            for line in crontab_lines(
                &config.scheduler,
                &exe.display().to_string(),
                config_path.as_deref(),
                &log_dir,
            )? {
                println!("{}", line);
            }
        }
    }

    Ok(())
}

// ==========================================
// 仓库出库释放系统 - 调度轮次命令行入口
// ==========================================
// 用法:
//   release-pass [--db <path>] [--channel <id>]... [--timeout-secs <n>] [--actor <name>] [--json]
//
// 未指定 --channel 时按定时触发处理 automatic / grouped_by_partner 通道;
// 指定后按人工触发只处理给定通道
// ==========================================

use anyhow::{anyhow, bail, Context};
use outbound_release::app::{get_default_db_path, AppState};
use outbound_release::engine::driver::PassOptions;
use std::time::{Duration, Instant};

struct CliArgs {
    db_path: String,
    channel_ids: Vec<String>,
    timeout: Option<Duration>,
    actor: String,
    json: bool,
}

fn parse_args() -> anyhow::Result<CliArgs> {
    let mut args = std::env::args().skip(1);
    let mut cli = CliArgs {
        db_path: get_default_db_path(),
        channel_ids: Vec::new(),
        timeout: None,
        actor: "scheduler".to_string(),
        json: false,
    };

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--db" => cli.db_path = args.next().ok_or_else(|| anyhow!("--db 需要参数"))?,
            "--channel" => cli
                .channel_ids
                .push(args.next().ok_or_else(|| anyhow!("--channel 需要参数"))?),
            "--timeout-secs" => {
                let raw = args.next().ok_or_else(|| anyhow!("--timeout-secs 需要参数"))?;
                let secs: u64 = raw.parse().with_context(|| format!("无效的超时秒数: {}", raw))?;
                cli.timeout = Some(Duration::from_secs(secs));
            }
            "--actor" => cli.actor = args.next().ok_or_else(|| anyhow!("--actor 需要参数"))?,
            "--json" => cli.json = true,
            other => bail!("未知参数: {}", other),
        }
    }
    Ok(cli)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = parse_args()?;
    if cli.json {
        outbound_release::logging::init_json();
    } else {
        outbound_release::logging::init();
    }

    tracing::info!("{} v{}", outbound_release::APP_NAME, outbound_release::VERSION);
    tracing::info!("使用数据库: {}", cli.db_path);

    let state = AppState::new(cli.db_path.clone())
        .await
        .map_err(|e| anyhow!(e))
        .context("AppState 初始化失败")?;

    let mut options = if cli.channel_ids.is_empty() {
        PassOptions::scheduled()
    } else {
        PassOptions::manual(cli.channel_ids.clone())
    };
    if let Some(timeout) = cli.timeout {
        options = options.with_deadline(Instant::now() + timeout);
    }

    let ctx = state.context(&cli.actor, chrono::Local::now().naive_local());
    let driver = state.driver.clone();
    let report = tokio::task::spawn_blocking(move || driver.run_pass(&ctx, &options))
        .await
        .context("调度轮次线程异常退出")??;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

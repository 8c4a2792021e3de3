use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use highlive::config::{AppConfig, ConfigManager};
use highlive::highlight::HighlightStore;
use highlive::models::{ChannelId, LiveStatus};
use highlive::Supervisor;

#[derive(Parser, Debug)]
#[command(name = "highlive")]
#[command(author, version, about = "Live chat highlight detector for SOOP and Chzzk")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 設定されたチャンネルを監視する
    Run {
        /// 設定ファイル（省略時はXDG設定ディレクトリ）
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// ハイライトファイルの統計を表示する
    Stats { file: PathBuf },
    /// デフォルト設定ファイルを書き出す
    InitConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn config_manager(path: Option<PathBuf>) -> anyhow::Result<ConfigManager> {
    match path {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => {
            let manager = config_manager(config)?;
            let config = manager.load_config()?;
            run(config).await
        }
        Command::Stats { file } => stats(&file),
        Command::InitConfig { config } => {
            let manager = config_manager(config)?;
            manager.save_config(&AppConfig::default())?;
            println!("{}", manager.config_path().display());
            Ok(())
        }
    }
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    // tokio-consoleの初期化（プロファイリング用）
    #[cfg(feature = "debug-tokio")]
    console_subscriber::init();

    #[cfg(not(feature = "debug-tokio"))]
    let _guard = {
        let log_dir = config.log_dir()?;
        highlive::logging::init_logging(&config.log, Some(log_dir.as_path()))?
    };

    tracing::info!("🎬 Starting highlive ({} channels)", config.channels.len());
    if config.channels.is_empty() {
        tracing::warn!("⚠️ No channels configured");
    }

    let channels = config.channels.clone();
    let mut supervisor = Supervisor::from_config(config)?;

    // ライブ状態の取得は外部に任せ、設定済みチャンネルは配信中として扱う
    let mut started = Vec::new();
    for entry in &channels {
        supervisor.add_channel(entry);
        let channel_id = ChannelId::new(&entry.channel_id);
        supervisor.update_status(
            &channel_id,
            LiveStatus {
                live: true,
                chat_url: entry.chat_url.clone(),
                chat_channel_id: entry.chat_channel_id.clone(),
                ..Default::default()
            },
        )?;
        supervisor
            .on_session_start(&channel_id, Utc::now(), None)
            .await?;
        started.push(channel_id);
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("🛑 終了シグナルを受信しました");

    for channel_id in &started {
        if let Err(e) = supervisor.on_session_end(channel_id, Utc::now(), None).await {
            tracing::error!("Failed to end stream for {}: {}", channel_id, e);
        }
    }
    supervisor.shutdown().await;

    tracing::info!("👋 highlive shutting down");
    Ok(())
}

fn stats(path: &std::path::Path) -> anyhow::Result<()> {
    let file = HighlightStore::load(path)?
        .with_context(|| format!("Highlight file not found: {}", path.display()))?;
    let stats = &file.statistics;

    println!("{} - {}", file.channel_name, file.last_title);
    println!("started:    {}", file.stream_start_time);
    if file.is_finished() {
        println!("ended:      {}", file.stream_end_time);
    }
    println!("updates:    {}", file.update_count);
    println!("highlights: {} ({} scored, {} big)", stats.total_highlights, stats.total_with_scores, stats.big_highlights);
    println!(
        "score:      avg {:.2} / max {:.2} / min {:.2}",
        stats.avg_score, stats.max_score, stats.min_score
    );
    let ranges = &stats.score_ranges;
    println!(
        "ranges:     0-20:{} 21-40:{} 41-60:{} 61-80:{} 81-100:{}",
        ranges.range_0_20, ranges.range_21_40, ranges.range_41_60, ranges.range_61_80, ranges.range_81_100
    );
    for comment in &file.timeline_comments {
        println!(
            "  [{}] Lv{} {} ({:+.1})",
            comment.comment_after_open_date, comment.fun_level, comment.text, comment.score_difference
        );
    }
    Ok(())
}

//! ログ初期化

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LogConfig;

/// tracingを初期化する
///
/// `RUST_LOG` が設定されていればそれを優先し、なければ設定ファイルのレベルを使う。
/// ファイル出力を有効にした場合は日次ローテーションのファイルにも書き出す。
/// 返されたガードはプロセス終了まで保持すること。
pub fn init_logging(
    config: &LogConfig,
    log_dir: Option<&std::path::Path>,
) -> anyhow::Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .or_else(|_| EnvFilter::try_new("info"))?;

    let console_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    match (config.enable_file_logging, log_dir) {
        (true, Some(dir)) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "highlive.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .try_init()?;

            Ok(Some(guard))
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .try_init()?;

            Ok(None)
        }
    }
}

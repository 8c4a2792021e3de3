//! アプリケーション設定管理モジュール
//!
//! XDGディレクトリを使用した設定ファイルの永続化と管理を提供します。

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use crate::models::PlatformKind;

/// 分析エンジン設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// ティック間隔（秒）
    pub tick_interval_secs: u64,
    /// 集計ウィンドウ（秒）
    pub window_secs: i64,
    /// メッセージ数ベースラインの平滑化係数
    pub ema_alpha: f64,
    /// ベースライン算出に使う直近ティック数
    pub baseline_ticks: usize,
    /// 直近1分の最小スコアからの差分（ハイライト判定）
    pub small_delta: f64,
    /// 大型ハイライト判定の差分
    pub big_delta: f64,
    pub cooldown_secs: i64,
    /// ピーク修正の探索を打ち切る連続非ハイライトティック数
    pub quiet_tick_cutoff: usize,
    /// スナップショット履歴の保持時間（分）
    pub history_minutes: i64,
    /// チャット保持時間（分）
    pub chat_retention_minutes: i64,
    /// 保留ハイライトの上限
    pub pending_limit: usize,
    /// ハイライトに添付するチャット件数
    pub context_sample_size: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 5,
            window_secs: 30,
            ema_alpha: 0.10,
            baseline_ticks: 20,
            small_delta: 15.0,
            big_delta: 70.0,
            cooldown_secs: 90,
            quiet_tick_cutoff: 3,
            history_minutes: 30,
            chat_retention_minutes: 30,
            pending_limit: 10,
            context_sample_size: 10,
        }
    }
}

impl AnalyzerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }
}

/// セッション（WebSocket接続）設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub keepalive_secs: u64,
    /// 受信タイムアウト（ミリ秒）
    pub read_timeout_ms: u64,
    pub reconnect_delay_secs: u64,
    /// 配信終了後、最後のチャットから切断までの猶予（秒）
    pub offline_grace_secs: u64,
    /// 切断時に各処理の停止を待つ時間（ミリ秒）
    pub cancel_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_secs: 10,
            read_timeout_ms: 1000,
            reconnect_delay_secs: 3,
            offline_grace_secs: 60,
            cancel_timeout_ms: 2000,
        }
    }
}

impl SessionConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs.max(1))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }
}

/// フレームバッファ設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BufferConfig {
    pub batch_size: usize,
    pub flush_timeout_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            flush_timeout_ms: 50,
        }
    }
}

/// デコーダ設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DecoderConfig {
    pub dedup_capacity: usize,
    /// この文字列を含むフレームは破棄
    pub spam_markers: Vec<String>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            dedup_capacity: 20,
            spam_markers: vec!["png".to_string(), "smartstore.naver.com".to_string()],
        }
    }
}

/// 通知配信設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatcherConfig {
    pub max_concurrent: usize,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub request_timeout_secs: u64,
    /// バックグラウンドキューの容量
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            max_attempts: 3,
            base_backoff_ms: 200,
            request_timeout_secs: 15,
            queue_capacity: 256,
        }
    }
}

/// 保存先設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// ハイライトJSONの保存ディレクトリ（Noneの場合はXDGデフォルト使用）
    pub highlight_dir: Option<PathBuf>,
    /// 分析履歴DB（Noneの場合はXDGデフォルト使用）
    pub history_db: Option<PathBuf>,
    pub retention_days: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            highlight_dir: None,
            history_db: None,
            retention_days: 14,
        }
    }
}

/// 要約サービス設定
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SummarizerConfig {
    /// 未設定ならオフラインの簡易要約を使う
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: Option<u64>,
}

/// ログ設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// カスタムログディレクトリ（Noneの場合はXDGデフォルト使用）
    pub log_dir: Option<PathBuf>,
    /// ログレベル (trace/debug/info/warn/error)
    pub log_level: String,
    /// ファイル出力有効化
    pub enable_file_logging: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            log_level: "info".to_string(),
            enable_file_logging: false,
        }
    }
}

/// 監視対象チャンネル
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelEntry {
    pub platform: PlatformKind,
    pub channel_id: String,
    pub channel_name: String,
    /// チャットサーバーのアドレス（SOOPのみ。ライブ状態取得側が通常提供する）
    #[serde(default)]
    pub chat_url: Option<String>,
    /// チャットルームID
    #[serde(default)]
    pub chat_channel_id: Option<String>,
    /// チャットを通知する投稿者ID
    #[serde(default)]
    pub watched_authors: Vec<String>,
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// 起動時に登録するWebhook URL
    pub webhooks: Vec<String>,
    /// 起動時に登録するプッシュ通知中継URL
    pub push_endpoints: Vec<String>,
    pub analyzer: AnalyzerConfig,
    pub session: SessionConfig,
    pub buffer: BufferConfig,
    pub decoder: DecoderConfig,
    pub dispatcher: DispatcherConfig,
    pub storage: StorageConfig,
    pub summarizer: SummarizerConfig,
    pub log: LogConfig,
    pub channels: Vec<ChannelEntry>,
}

impl AppConfig {
    /// ハイライト保存ディレクトリを解決
    pub fn highlight_dir(&self) -> Result<PathBuf> {
        match &self.storage.highlight_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(project_dirs()?.data_dir().join("highlights")),
        }
    }

    /// 分析履歴DBのパスを解決
    pub fn history_db_path(&self) -> Result<PathBuf> {
        match &self.storage.history_db {
            Some(path) => Ok(path.clone()),
            None => Ok(project_dirs()?.data_dir().join("history.db")),
        }
    }

    /// ログディレクトリを解決
    pub fn log_dir(&self) -> Result<PathBuf> {
        match &self.log.log_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(project_dirs()?.data_dir().join("logs")),
        }
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("dev", "highlive", "highlive").context("Failed to get project directories")
}

/// 設定管理マネージャー
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// XDG設定ディレクトリを使う設定マネージャーを作成
    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_path()?;
        Self::with_path(config_path)
    }

    /// 指定パスの設定マネージャーを作成
    pub fn with_path(config_path: PathBuf) -> Result<Self> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        Ok(Self { config_path })
    }

    fn get_config_path() -> Result<PathBuf> {
        let config_file = project_dirs()?.config_dir().join("config.toml");
        debug!("Config file path: {}", config_file.display());
        Ok(config_file)
    }

    pub fn config_path(&self) -> &PathBuf {
        &self.config_path
    }

    /// 設定を読み込み
    pub fn load_config(&self) -> Result<AppConfig> {
        if !self.config_path.exists() {
            info!(
                "Config file not found, using default settings: {}",
                self.config_path.display()
            );
            return Ok(AppConfig::default());
        }

        let config_content = fs::read_to_string(&self.config_path).with_context(|| {
            format!("Failed to read config file: {}", self.config_path.display())
        })?;

        let config: AppConfig = toml::from_str(&config_content).with_context(|| {
            format!(
                "Failed to parse config file: {}",
                self.config_path.display()
            )
        })?;

        info!(
            "✅ Configuration loaded from: {}",
            self.config_path.display()
        );

        Ok(config)
    }

    /// 設定を保存
    pub fn save_config(&self, config: &AppConfig) -> Result<()> {
        let config_content =
            toml::to_string_pretty(config).context("Failed to serialize config")?;

        fs::write(&self.config_path, config_content).with_context(|| {
            format!(
                "Failed to write config file: {}",
                self.config_path.display()
            )
        })?;

        info!("💾 Configuration saved to: {}", self.config_path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_values() {
        let config = AppConfig::default();
        assert_eq!(config.analyzer.tick_interval_secs, 5);
        assert_eq!(config.analyzer.window_secs, 30);
        assert_eq!(config.analyzer.cooldown_secs, 90);
        assert_eq!(config.analyzer.small_delta, 15.0);
        assert_eq!(config.analyzer.big_delta, 70.0);
        assert_eq!(config.buffer.batch_size, 5);
        assert_eq!(config.buffer.flush_timeout_ms, 50);
        assert_eq!(config.decoder.dedup_capacity, 20);
        assert_eq!(config.dispatcher.max_concurrent, 5);
        assert_eq!(config.dispatcher.max_attempts, 3);
        assert_eq!(config.storage.retention_days, 14);
    }

    #[test]
    fn test_missing_file_returns_default() {
        let dir = tempdir().unwrap();
        let manager = ConfigManager::with_path(dir.path().join("config.toml")).unwrap();
        let config = manager.load_config().unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let manager = ConfigManager::with_path(dir.path().join("nested/config.toml")).unwrap();

        let mut config = AppConfig::default();
        config.analyzer.cooldown_secs = 120;
        config.webhooks.push("http://localhost:9000/hook".to_string());
        config.channels.push(ChannelEntry {
            platform: PlatformKind::Chzzk,
            channel_id: "abc".to_string(),
            channel_name: "テスト配信".to_string(),
            chat_url: None,
            chat_channel_id: Some("room".to_string()),
            watched_authors: vec!["fan01".to_string()],
        });

        manager.save_config(&config).unwrap();
        let loaded = manager.load_config().unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[analyzer]\ncooldown_secs = 30\n").unwrap();

        let config = ConfigManager::with_path(path).unwrap().load_config().unwrap();
        assert_eq!(config.analyzer.cooldown_secs, 30);
        assert_eq!(config.analyzer.tick_interval_secs, 5);
        assert_eq!(config.session.keepalive_secs, 10);
    }

    #[test]
    fn test_broken_file_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "analyzer = [").unwrap();

        let result = ConfigManager::with_path(path).unwrap().load_config();
        assert!(result.is_err());
    }
}

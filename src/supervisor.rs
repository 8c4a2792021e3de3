//! チャンネルの監督
//!
//! チャンネルごとに `ChannelContext` を作り、セッションと分析タスクを起動する。
//! 外部のライブ状態ポーラーからの通知（状態更新、配信開始・終了）を各タスクへ伝える。

use anyhow::Context;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::analyzer::{AnalyzerCommand, AnalyzerTask, WindowedAnalyzer};
use crate::config::{AppConfig, ChannelEntry};
use crate::context::ChannelContext;
use crate::decoder::{Normalizer, TagClassifier};
use crate::error::{HighliveError, HighliveResult};
use crate::highlight::{summarizer, HighlightLifecycleManager, HighlightStore, LifecycleJob};
use crate::history::HistoryStore;
use crate::models::{ChannelId, Endpoint, LiveStatus, NotificationJob, StreamSession};
use crate::notify::{
    self, Dispatcher, EndpointRegistry, Notifier, PushTransport, WebhookTransport,
};
use crate::platform::{self, ChatPlatform};
use crate::session::Session;
use crate::work_queue::WorkQueue;

/// セッション→分析タスクのイベントキュー容量
const EVENT_QUEUE_CAPACITY: usize = 1024;
const COMMAND_QUEUE_CAPACITY: usize = 16;
/// 停止時にタスクの終了を待つ時間
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

struct ChannelHandle {
    ctx: Arc<ChannelContext>,
    commands: mpsc::Sender<AnalyzerCommand>,
    session_task: JoinHandle<()>,
    analyzer_task: JoinHandle<()>,
}

pub struct Supervisor {
    config: AppConfig,
    classifier: Arc<TagClassifier>,
    registry: Arc<EndpointRegistry>,
    lifecycle_queue: WorkQueue<LifecycleJob>,
    notify_queue: WorkQueue<NotificationJob>,
    channels: HashMap<ChannelId, ChannelHandle>,
}

impl Supervisor {
    pub fn new(
        config: AppConfig,
        lifecycle: Arc<HighlightLifecycleManager>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        let registry = Arc::clone(dispatcher.registry());
        let capacity = config.dispatcher.queue_capacity;
        Self {
            classifier: Arc::new(TagClassifier::new()),
            registry,
            lifecycle_queue: WorkQueue::new("lifecycle", capacity, lifecycle),
            notify_queue: WorkQueue::new("notify", capacity, dispatcher),
            channels: HashMap::new(),
            config,
        }
    }

    /// 設定から保存先・要約器・通知を組み立てる
    pub fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        let history_path = config.history_db_path()?;
        let history = HistoryStore::open(&history_path).with_context(|| {
            format!("Failed to open history database: {}", history_path.display())
        })?;
        let store = HighlightStore::new(config.highlight_dir()?);
        let summarizer = summarizer::from_config(&config.summarizer)
            .context("Failed to build summarizer")?;
        let lifecycle = Arc::new(HighlightLifecycleManager::new(
            store,
            summarizer,
            Some(Arc::new(history)),
            config.storage.retention_days,
        ));

        let timeout = Duration::from_secs(config.dispatcher.request_timeout_secs);
        let dispatcher = Dispatcher::new(&config.dispatcher, Arc::new(EndpointRegistry::new()))
            .with_transport(Arc::new(WebhookTransport::new(timeout)?))
            .with_transport(Arc::new(PushTransport::new(timeout)?));

        Ok(Self::new(config, lifecycle, Arc::new(dispatcher)))
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn context(&self, channel_id: &ChannelId) -> Option<Arc<ChannelContext>> {
        self.channels.get(channel_id).map(|h| Arc::clone(&h.ctx))
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.channels.keys().cloned().collect()
    }

    /// 設定のチャンネルを追加してタスクを起動する
    pub fn add_channel(&mut self, entry: &ChannelEntry) -> Arc<ChannelContext> {
        let channel_id = ChannelId::new(&entry.channel_id);
        let platform = platform::for_kind(entry.platform, &channel_id);
        self.add_channel_with_platform(entry, platform)
    }

    pub fn add_channel_with_platform(
        &mut self,
        entry: &ChannelEntry,
        platform: Arc<dyn ChatPlatform>,
    ) -> Arc<ChannelContext> {
        let channel_id = ChannelId::new(&entry.channel_id);
        if let Some(existing) = self.channels.get(&channel_id) {
            warn!("⚠️ [SUPERVISOR] channel already added: {}", channel_id);
            return Arc::clone(&existing.ctx);
        }

        let ctx = Arc::new(ChannelContext::new(
            channel_id.clone(),
            &entry.channel_name,
            entry.platform,
        ));
        ctx.update_status(LiveStatus {
            chat_url: entry.chat_url.clone(),
            chat_channel_id: entry.chat_channel_id.clone(),
            ..Default::default()
        });

        self.register_endpoints(&channel_id);

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);

        let normalizer = Normalizer::new(
            channel_id.clone(),
            Arc::clone(&self.classifier),
            &self.config.decoder,
        );
        let session = Session::new(
            Arc::clone(&ctx),
            platform,
            normalizer,
            event_tx,
            self.config.session.clone(),
            self.config.buffer.clone(),
        );

        let notifier = Notifier::new(self.notify_queue.handle(), Arc::clone(&self.registry));
        let analyzer = AnalyzerTask::new(
            Arc::clone(&ctx),
            WindowedAnalyzer::new(self.config.analyzer.clone()),
            event_rx,
            command_rx,
            self.lifecycle_queue.handle(),
        )
        .with_notifier(notifier)
        .with_watched_authors(entry.watched_authors.iter().cloned());

        let handle = ChannelHandle {
            ctx: Arc::clone(&ctx),
            commands: command_tx,
            session_task: tokio::spawn(session.run()),
            analyzer_task: tokio::spawn(analyzer.run()),
        };
        info!(
            "➕ [SUPERVISOR] channel added: {} ({}) platform={}",
            entry.channel_name, channel_id, entry.platform
        );
        self.channels.insert(channel_id, handle);
        ctx
    }

    /// 設定の通知先を各受信者集合へ登録する
    fn register_endpoints(&self, channel_id: &ChannelId) {
        let sets = [
            notify::highlight_recipients(channel_id),
            notify::chat_recipients(channel_id),
        ];
        for set in &sets {
            for url in &self.config.webhooks {
                self.registry.register(set, Endpoint::webhook(url));
            }
            for url in &self.config.push_endpoints {
                self.registry.register(set, Endpoint::push(url));
            }
        }
    }

    fn handle(&self, channel_id: &ChannelId) -> HighliveResult<&ChannelHandle> {
        self.channels
            .get(channel_id)
            .ok_or_else(|| HighliveError::generic("supervisor", format!("unknown channel {}", channel_id)))
    }

    /// ライブ状態を更新する
    pub fn update_status(&self, channel_id: &ChannelId, status: LiveStatus) -> HighliveResult<()> {
        let handle = self.handle(channel_id)?;
        debug!(
            "[SUPERVISOR] status {} live={} viewers={}",
            channel_id, status.live, status.viewer_count
        );
        handle.ctx.update_status(status);
        Ok(())
    }

    /// 再接続を要求する
    pub fn request_rejoin(&self, channel_id: &ChannelId) -> HighliveResult<()> {
        self.handle(channel_id)?.ctx.request_rejoin();
        Ok(())
    }

    /// 配信開始のシグナル。同じ配信の重複は既存の記録を返す
    pub async fn on_session_start(
        &self,
        channel_id: &ChannelId,
        started_at: DateTime<Utc>,
        start_id: Option<String>,
    ) -> HighliveResult<StreamSession> {
        let handle = self.handle(channel_id)?;
        if let Some(current) = handle.ctx.current_stream() {
            if current.started_at == started_at {
                return Ok(current);
            }
        }

        let status = handle.ctx.status();
        let mut session = StreamSession::new(
            channel_id.clone(),
            &handle.ctx.channel_name,
            started_at,
            status.title,
        );
        session.start_id = start_id;
        handle.ctx.set_stream(Some(session.clone()));

        info!("🟢 [SUPERVISOR] stream started {}", session.key());
        handle
            .commands
            .send(AnalyzerCommand::StreamStarted(session.clone()))
            .await
            .map_err(|_| HighliveError::generic("supervisor", "analyzer task stopped"))?;
        Ok(session)
    }

    /// 配信終了のシグナル。開いている配信がなければ何もしない
    pub async fn on_session_end(
        &self,
        channel_id: &ChannelId,
        ended_at: DateTime<Utc>,
        end_id: Option<String>,
    ) -> HighliveResult<Option<StreamSession>> {
        let handle = self.handle(channel_id)?;
        let Some(mut session) = handle.ctx.current_stream() else {
            debug!("[SUPERVISOR] end signal without open stream: {}", channel_id);
            return Ok(None);
        };
        handle.ctx.set_stream(None);

        session.ended_at = Some(ended_at);
        session.end_id = end_id;
        let title = handle.ctx.status().title;
        if !title.is_empty() {
            session.last_known_title = title;
        }

        info!("🔴 [SUPERVISOR] stream ended {}", session.key());
        handle
            .commands
            .send(AnalyzerCommand::StreamEnded(session.clone()))
            .await
            .map_err(|_| HighliveError::generic("supervisor", "analyzer task stopped"))?;
        Ok(Some(session))
    }

    /// 全チャンネルを止め、キューを処理し切ってから終える
    pub async fn shutdown(self) {
        info!("🛑 [SUPERVISOR] shutting down {} channels", self.channels.len());

        for handle in self.channels.values() {
            handle.ctx.cancel.cancel();
        }
        for (channel_id, handle) in self.channels {
            for (name, task) in [
                ("session", handle.session_task),
                ("analyzer", handle.analyzer_task),
            ] {
                let abort = task.abort_handle();
                match tokio::time::timeout(TASK_STOP_TIMEOUT, task).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("⚠️ [SUPERVISOR] {} task failed for {}: {}", name, channel_id, e),
                    Err(_) => {
                        warn!("⚠️ [SUPERVISOR] {} task did not stop for {}, aborting", name, channel_id);
                        abort.abort();
                    }
                }
            }
        }

        self.lifecycle_queue.shutdown(true).await;
        self.notify_queue.shutdown(true).await;
        info!("🛑 [SUPERVISOR] stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::highlight::BasicSummarizer;
    use crate::models::PlatformKind;
    use tempfile::tempdir;

    fn entry(id: &str) -> ChannelEntry {
        ChannelEntry {
            platform: PlatformKind::Soop,
            channel_id: id.to_string(),
            channel_name: format!("{} name", id),
            chat_url: None,
            chat_channel_id: None,
            watched_authors: vec![],
        }
    }

    fn supervisor(dir: &std::path::Path) -> (Supervisor, Arc<HighlightLifecycleManager>) {
        let lifecycle = Arc::new(HighlightLifecycleManager::new(
            HighlightStore::new(dir),
            Arc::new(BasicSummarizer),
            None,
            14,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            &Default::default(),
            Arc::new(EndpointRegistry::new()),
        ));
        let config = AppConfig {
            webhooks: vec!["http://127.0.0.1:9/hook".to_string()],
            ..Default::default()
        };
        (
            Supervisor::new(config, Arc::clone(&lifecycle), dispatcher),
            lifecycle,
        )
    }

    #[tokio::test]
    async fn test_session_signals_reach_lifecycle() {
        let dir = tempdir().unwrap();
        let (mut supervisor, lifecycle) = supervisor(dir.path());
        let ctx = supervisor.add_channel(&entry("bj"));
        let channel = ctx.channel_id.clone();

        let started = Utc::now();
        let session = supervisor
            .on_session_start(&channel, started, Some("1001".into()))
            .await
            .unwrap();
        // 重複した開始は同じ記録を返す
        let again = supervisor
            .on_session_start(&channel, started, None)
            .await
            .unwrap();
        assert_eq!(session, again);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(lifecycle.is_active(&session.key()));

        let ended = supervisor
            .on_session_end(&channel, Utc::now(), Some("1002".into()))
            .await
            .unwrap();
        assert!(ended.is_some());
        assert!(supervisor
            .on_session_end(&channel, Utc::now(), None)
            .await
            .unwrap()
            .is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!lifecycle.is_active(&session.key()));
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_endpoints_registered_per_channel() {
        let dir = tempdir().unwrap();
        let (mut supervisor, _) = supervisor(dir.path());
        let ctx = supervisor.add_channel(&entry("bj"));
        let set = notify::highlight_recipients(&ctx.channel_id);
        assert_eq!(supervisor.registry().endpoints(&set).len(), 1);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_channel() {
        let dir = tempdir().unwrap();
        let (supervisor, _) = supervisor(dir.path());
        let result = supervisor.update_status(&ChannelId::new("nope"), LiveStatus::default());
        assert!(result.is_err());
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_open_stream() {
        let dir = tempdir().unwrap();
        let (mut supervisor, lifecycle) = supervisor(dir.path());
        let ctx = supervisor.add_channel(&entry("bj"));
        let session = supervisor
            .on_session_start(&ctx.channel_id, Utc::now(), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        supervisor.shutdown().await;
        assert!(!lifecycle.is_active(&session.key()));
    }
}

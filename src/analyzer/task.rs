//! チャンネルごとの分析タスク
//!
//! セッションから届くチャットを取り込み、一定間隔でティックを実行する。
//! 配信開始・終了のシグナルを受けてライフサイクルのジョブを投入する。

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::engine::{HighlightChange, TickOutcome, WindowedAnalyzer};
use crate::context::ChannelContext;
use crate::highlight::LifecycleJob;
use crate::models::{ChatEvent, StreamSession};
use crate::notify::{self, format, Notifier};
use crate::work_queue::WorkQueueHandle;

/// 配信境界のシグナル
#[derive(Debug, Clone)]
pub enum AnalyzerCommand {
    StreamStarted(StreamSession),
    /// 終了時刻などを埋めた配信
    StreamEnded(StreamSession),
}

pub struct AnalyzerTask {
    ctx: Arc<ChannelContext>,
    analyzer: WindowedAnalyzer,
    events: mpsc::Receiver<ChatEvent>,
    commands: mpsc::Receiver<AnalyzerCommand>,
    lifecycle: WorkQueueHandle<LifecycleJob>,
    notifier: Option<Notifier>,
    watched_authors: HashSet<String>,
    stream: Option<StreamSession>,
}

impl AnalyzerTask {
    pub fn new(
        ctx: Arc<ChannelContext>,
        analyzer: WindowedAnalyzer,
        events: mpsc::Receiver<ChatEvent>,
        commands: mpsc::Receiver<AnalyzerCommand>,
        lifecycle: WorkQueueHandle<LifecycleJob>,
    ) -> Self {
        Self {
            ctx,
            analyzer,
            events,
            commands,
            lifecycle,
            notifier: None,
            watched_authors: HashSet::new(),
            stream: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// チャットを通知する投稿者
    pub fn with_watched_authors(mut self, authors: impl IntoIterator<Item = String>) -> Self {
        self.watched_authors = authors.into_iter().collect();
        self
    }

    pub async fn run(mut self) {
        let channel = self.ctx.channel_id.clone();
        let mut ticker = tokio::time::interval(self.analyzer.config().tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("📊 [ANALYZER] start: channel={}", channel);

        loop {
            tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => break,
                Some(command) = self.commands.recv() => self.handle_command(command).await,
                Some(event) = self.events.recv() => self.on_event(event),
                _ = ticker.tick() => self.on_tick().await,
            }
        }

        // 停止時に開いている配信を閉じる
        if let Some(mut stream) = self.stream.take() {
            stream.ended_at.get_or_insert_with(Utc::now);
            self.finish_stream(stream).await;
        }
        info!("📊 [ANALYZER] stop: channel={}", channel);
    }

    async fn handle_command(&mut self, command: AnalyzerCommand) {
        match command {
            AnalyzerCommand::StreamStarted(session) => {
                if let Some(mut previous) = self.stream.take() {
                    if previous.key() == session.key() {
                        debug!("[ANALYZER] duplicate start ignored {}", session.key());
                        self.stream = Some(previous);
                        return;
                    }
                    warn!(
                        "⚠️ [ANALYZER] new stream while {} is open, closing it",
                        previous.key()
                    );
                    previous.ended_at.get_or_insert(session.started_at);
                    self.finish_stream(previous).await;
                }

                self.analyzer.begin_stream(&session);
                self.stream = Some(session.clone());
                self.submit(LifecycleJob::Start(session)).await;
            }
            AnalyzerCommand::StreamEnded(session) => {
                let (highlights, history) = match &self.stream {
                    Some(open) if open.key() == session.key() => {
                        self.stream = None;
                        self.analyzer.end_stream()
                    }
                    // 重複した終了シグナルはライフサイクル側で無視される
                    _ => (Vec::new(), Vec::new()),
                };
                self.submit(LifecycleJob::End {
                    session,
                    highlights,
                    history,
                })
                .await;
            }
        }
    }

    async fn finish_stream(&mut self, session: StreamSession) {
        let (highlights, history) = self.analyzer.end_stream();
        self.submit(LifecycleJob::End {
            session,
            highlights,
            history,
        })
        .await;
    }

    async fn submit(&self, job: LifecycleJob) {
        if let Err(e) = self.lifecycle.enqueue(job).await {
            warn!("⚠️ [ANALYZER] lifecycle job rejected: {}", e);
        }
    }

    fn on_event(&mut self, event: ChatEvent) {
        if self.watched_authors.contains(&event.author) {
            if let Some(notifier) = &self.notifier {
                let payload = format::chat_payload(&self.ctx.channel_name, &event);
                let set = notify::chat_recipients(&self.ctx.channel_id);
                if let Err(e) = notifier.notify(&set, payload) {
                    warn!("⚠️ [ANALYZER] chat notification dropped: {}", e);
                }
            }
        }
        self.analyzer.ingest(event);
    }

    async fn on_tick(&mut self) {
        let outcome = self.analyzer.tick(Utc::now(), self.ctx.viewer_count());
        debug!(
            "[ANALYZER] tick channel={} messages={} score={:.1}",
            self.ctx.channel_id, outcome.snapshot.window_message_count, outcome.snapshot.fun_score
        );
        self.handle_outcome(outcome).await;
    }

    async fn handle_outcome(&mut self, outcome: TickOutcome) {
        // 通常のハイライトは記録のみ。大型だけ即時通知する
        if let Some(highlight) = outcome.change.as_ref().and_then(HighlightChange::big_announcement) {
            if let Some(notifier) = &self.notifier {
                let title = self
                    .stream
                    .as_ref()
                    .map(|s| s.last_known_title.as_str())
                    .unwrap_or_default();
                let payload = format::highlight_payload(&self.ctx.channel_name, title, highlight);
                let set = notify::highlight_recipients(&self.ctx.channel_id);
                if let Err(e) = notifier.notify(&set, payload) {
                    warn!("⚠️ [ANALYZER] highlight notification dropped: {}", e);
                }
            }
        }

        if !outcome.overflow.is_empty() {
            if let Some(stream) = &self.stream {
                let job = LifecycleJob::Flush {
                    key: stream.key(),
                    highlights: outcome.overflow,
                };
                self.submit(job).await;
            }
        }
    }
}

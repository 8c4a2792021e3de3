//! ハイライトのライフサイクル管理
//!
//! 配信セッションごとに保留ハイライトを受け取り、配信終了時に
//! 履歴の書き出し・要約・ファイルへのマージを一度だけ行う。
//! ジョブはワークキューの単一ワーカーで順に処理される。

pub mod store;
pub mod summarizer;

pub use store::{HighlightComment, HighlightFile, HighlightStatistics, HighlightStore, MergeOutcome};
pub use summarizer::{BasicSummarizer, HttpSummarizer, Summarizer};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{HighliveError, HighliveResult};
use crate::history::HistoryStore;
use crate::models::{AnalysisSnapshot, Highlight, StreamSession, StreamSessionKey};
use crate::work_queue::JobHandler;

/// ライフサイクルのジョブ
#[derive(Debug, Clone)]
pub enum LifecycleJob {
    Start(StreamSession),
    /// 保留上限を超えた分の先行フラッシュ
    Flush {
        key: StreamSessionKey,
        highlights: Vec<Highlight>,
    },
    End {
        session: StreamSession,
        highlights: Vec<Highlight>,
        history: Vec<AnalysisSnapshot>,
    },
}

/// 配信終了処理の結果
#[derive(Debug, Clone, PartialEq)]
pub enum EndOutcome {
    Flushed { path: Option<PathBuf>, saved: usize },
    /// 既に終了済み（重複シグナル）
    AlreadyFinished,
}

#[derive(Debug)]
struct SessionEntry {
    session: StreamSession,
    /// 保存に失敗して持ち越しているハイライト
    unsaved: Vec<Highlight>,
}

pub struct HighlightLifecycleManager {
    store: HighlightStore,
    summarizer: Arc<dyn Summarizer>,
    history: Option<Arc<HistoryStore>>,
    retention: Duration,
    sessions: Mutex<HashMap<StreamSessionKey, SessionEntry>>,
    finished: Mutex<HashMap<StreamSessionKey, DateTime<Utc>>>,
}

impl HighlightLifecycleManager {
    pub fn new(
        store: HighlightStore,
        summarizer: Arc<dyn Summarizer>,
        history: Option<Arc<HistoryStore>>,
        retention_days: i64,
    ) -> Self {
        Self {
            store,
            summarizer,
            history,
            retention: Duration::days(retention_days),
            sessions: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &HighlightStore {
        &self.store
    }

    pub fn is_active(&self, key: &StreamSessionKey) -> bool {
        self.sessions.lock().contains_key(key)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    /// 配信開始を登録する。古いセッション記録はここで掃除する
    pub async fn start_session(&self, session: StreamSession) -> HighliveResult<()> {
        self.prune_stale(Utc::now()).await;

        let key = session.key();
        if let Some(history) = &self.history {
            let history = Arc::clone(history);
            let record = session.clone();
            tokio::task::spawn_blocking(move || history.record_session_start(&record))
                .await
                .map_err(|e| HighliveError::generic("record_session_start", e.to_string()))??;
        }

        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&key) {
            debug!("[LIFECYCLE] duplicate start ignored {}", key);
            return Ok(());
        }
        self.finished.lock().remove(&key);
        info!("🎬 [LIFECYCLE] session started {}", key);
        sessions.insert(
            key,
            SessionEntry {
                session,
                unsaved: Vec::new(),
            },
        );
        Ok(())
    }

    /// 14日より古いセッション記録を捨てる
    async fn prune_stale(&self, now: DateTime<Utc>) {
        let cutoff = now - self.retention;
        {
            let mut sessions = self.sessions.lock();
            let before = sessions.len();
            sessions.retain(|key, _| key.started_at >= cutoff);
            if sessions.len() != before {
                warn!(
                    "🧹 [LIFECYCLE] dropped {} stale sessions without end signal",
                    before - sessions.len()
                );
            }
        }
        self.finished.lock().retain(|key, _| key.started_at >= cutoff);

        if let Some(history) = &self.history {
            let history = Arc::clone(history);
            let result =
                tokio::task::spawn_blocking(move || history.prune_sessions_before(cutoff)).await;
            match result {
                Ok(Err(e)) => warn!("⚠️ [LIFECYCLE] history prune failed: {}", e),
                Err(e) => warn!("⚠️ [LIFECYCLE] history prune task failed: {}", e),
                Ok(Ok(_)) => {}
            }
        }
    }

    /// 要約してファイルへマージする。要約の失敗はバッチを捨ててログに残す
    async fn summarize_and_save(
        &self,
        session: &StreamSession,
        highlights: &[Highlight],
    ) -> HighliveResult<Option<MergeOutcome>> {
        if highlights.is_empty() {
            return Ok(None);
        }

        let comments = match self.summarizer.summarize(session, highlights).await {
            Ok(comments) => comments,
            Err(e) => {
                error!(
                    "❌ [LIFECYCLE] summarizer '{}' failed, {} highlights skipped: {}",
                    self.summarizer.name(),
                    highlights.len(),
                    e
                );
                return Ok(None);
            }
        };

        let store = self.store.clone();
        let session = session.clone();
        let outcome = tokio::task::spawn_blocking(move || store.merge_and_save(&session, comments))
            .await
            .map_err(|e| HighliveError::generic("merge_and_save", e.to_string()))??;
        Ok(Some(outcome))
    }

    /// 保留上限を超えた分を先に保存する
    pub async fn flush_batch(
        &self,
        key: &StreamSessionKey,
        highlights: Vec<Highlight>,
    ) -> HighliveResult<usize> {
        let Some(session) = self.sessions.lock().get(key).map(|e| e.session.clone()) else {
            error!("🚨 [INVARIANT] flush for unknown session {}", key);
            return Err(HighliveError::invariant(format!(
                "flush for unknown session {}",
                key
            )));
        };

        match self.summarize_and_save(&session, &highlights).await {
            Ok(outcome) => Ok(outcome.map(|o| o.added).unwrap_or(0)),
            Err(e) => {
                warn!("⚠️ [LIFECYCLE] early flush failed, kept for session end: {}", e);
                if let Some(entry) = self.sessions.lock().get_mut(key) {
                    entry.unsaved.extend(highlights);
                }
                Err(e)
            }
        }
    }

    /// 配信終了処理。同じセッションへの2回目以降は何もしない
    pub async fn end_session(
        &self,
        session: StreamSession,
        highlights: Vec<Highlight>,
        history: Vec<AnalysisSnapshot>,
    ) -> HighliveResult<EndOutcome> {
        let key = session.key();
        if self.finished.lock().contains_key(&key) {
            debug!("[LIFECYCLE] duplicate end ignored {}", key);
            return Ok(EndOutcome::AlreadyFinished);
        }

        let carried = match self.sessions.lock().get_mut(&key) {
            Some(entry) => std::mem::take(&mut entry.unsaved),
            None => {
                error!("🚨 [INVARIANT] session end without start {}", key);
                return Err(HighliveError::invariant(format!(
                    "session end without start {}",
                    key
                )));
            }
        };

        self.flush_history(&session, history).await;

        let mut batch = carried;
        batch.extend(highlights);

        match self.summarize_and_save(&session, &batch).await {
            Ok(outcome) => {
                self.sessions.lock().remove(&key);
                self.finished.lock().insert(key.clone(), Utc::now());
                info!(
                    "🏁 [LIFECYCLE] session finished {} highlights={}",
                    key,
                    batch.len()
                );
                Ok(EndOutcome::Flushed {
                    saved: outcome.as_ref().map(|o| o.added).unwrap_or(0),
                    path: outcome.map(|o| o.path),
                })
            }
            Err(e) => {
                error!("❌ [LIFECYCLE] highlight save failed for {}: {}", key, e);
                if let Some(entry) = self.sessions.lock().get_mut(&key) {
                    entry.unsaved = batch;
                    entry.session = session;
                }
                Err(e)
            }
        }
    }

    /// 分析履歴をまとめて書き出す。失敗してもハイライトの保存は続ける
    async fn flush_history(&self, session: &StreamSession, snapshots: Vec<AnalysisSnapshot>) {
        let Some(history) = &self.history else {
            return;
        };
        let history = Arc::clone(history);
        let session = session.clone();
        let result = tokio::task::spawn_blocking(move || -> HighliveResult<usize> {
            history.record_session_start(&session)?;
            let saved = history.save_snapshots(&session.key(), &snapshots)?;
            history.record_session_end(&session)?;
            Ok(saved)
        })
        .await;

        match result {
            Ok(Ok(saved)) => debug!("[LIFECYCLE] {} snapshots written", saved),
            Ok(Err(e)) => warn!("⚠️ [LIFECYCLE] history flush failed: {}", e),
            Err(e) => warn!("⚠️ [LIFECYCLE] history flush task failed: {}", e),
        }
    }
}

#[async_trait]
impl JobHandler<LifecycleJob> for HighlightLifecycleManager {
    async fn handle(&self, job: LifecycleJob) {
        let result = match job {
            LifecycleJob::Start(session) => self.start_session(session).await,
            LifecycleJob::Flush { key, highlights } => {
                self.flush_batch(&key, highlights).await.map(|_| ())
            }
            LifecycleJob::End {
                session,
                highlights,
                history,
            } => self.end_session(session, highlights, history).await.map(|_| ()),
        };
        if let Err(e) = result {
            // 不整合はそれぞれの箇所で記録済み
            if !matches!(e, HighliveError::Invariant(_)) {
                error!("❌ [LIFECYCLE] job failed: {}", e);
            }
        }
    }
}

//! バックグラウンド作業キュー
//!
//! ファイル保存や通知などの副作用をスコア計算の経路から切り離す。
//! 送信側は `try_enqueue` で待たずに投入し、1つのワーカーが順に処理する。

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue '{0}' is full")]
    Full(&'static str),
    #[error("queue '{0}' is closed")]
    Closed(&'static str),
}

/// キューのジョブを処理する
#[async_trait]
pub trait JobHandler<J>: Send + Sync + 'static {
    async fn handle(&self, job: J);
}

#[derive(Debug, Default)]
struct QueueStats {
    processed: AtomicU64,
    dropped: AtomicU64,
}

/// 投入用ハンドル
pub struct WorkQueueHandle<J> {
    name: &'static str,
    sender: mpsc::Sender<J>,
    stats: Arc<QueueStats>,
}

impl<J> Clone for WorkQueueHandle<J> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            sender: self.sender.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<J: Send + 'static> WorkQueueHandle<J> {
    /// 待たずに投入する。満杯なら破棄してエラー
    pub fn try_enqueue(&self, job: J) -> Result<(), QueueError> {
        self.sender.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("⚠️ [QUEUE] {} is full, job dropped", self.name);
                QueueError::Full(self.name)
            }
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed(self.name),
        })
    }

    /// 空きが出るまで待って投入する
    pub async fn enqueue(&self, job: J) -> Result<(), QueueError> {
        self.sender
            .send(job)
            .await
            .map_err(|_| QueueError::Closed(self.name))
    }

    pub fn dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }
}

/// 有界キューと処理タスク
pub struct WorkQueue<J> {
    handle: WorkQueueHandle<J>,
    worker: JoinHandle<()>,
    shutdown: CancellationToken,
    drain: Arc<AtomicBool>,
}

impl<J: Send + 'static> WorkQueue<J> {
    /// キューを作成し、処理タスクを開始
    pub fn new(name: &'static str, capacity: usize, handler: Arc<dyn JobHandler<J>>) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let stats = Arc::new(QueueStats::default());
        let shutdown = CancellationToken::new();
        let drain = Arc::new(AtomicBool::new(true));

        let worker = tokio::spawn(Self::process_queue(
            name,
            receiver,
            handler,
            Arc::clone(&stats),
            shutdown.clone(),
            Arc::clone(&drain),
        ));

        Self {
            handle: WorkQueueHandle {
                name,
                sender,
                stats,
            },
            worker,
            shutdown,
            drain,
        }
    }

    pub fn handle(&self) -> WorkQueueHandle<J> {
        self.handle.clone()
    }

    pub fn processed(&self) -> u64 {
        self.handle.stats.processed.load(Ordering::Relaxed)
    }

    /// 停止する。`drain` が真なら残りのジョブを処理してから終える
    pub async fn shutdown(self, drain: bool) {
        self.drain.store(drain, Ordering::SeqCst);
        self.shutdown.cancel();
        if let Err(e) = self.worker.await {
            tracing::error!("❌ [QUEUE] {} worker panicked: {}", self.handle.name, e);
        }
    }

    async fn process_queue(
        name: &'static str,
        mut receiver: mpsc::Receiver<J>,
        handler: Arc<dyn JobHandler<J>>,
        stats: Arc<QueueStats>,
        shutdown: CancellationToken,
        drain: Arc<AtomicBool>,
    ) {
        tracing::info!("🧵 [QUEUE] {} worker started", name);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                job = receiver.recv() => match job {
                    Some(job) => {
                        handler.handle(job).await;
                        stats.processed.fetch_add(1, Ordering::Relaxed);
                    }
                    None => break,
                },
            }
        }

        receiver.close();
        if drain.load(Ordering::SeqCst) {
            let mut drained = 0;
            while let Some(job) = receiver.recv().await {
                handler.handle(job).await;
                stats.processed.fetch_add(1, Ordering::Relaxed);
                drained += 1;
            }
            if drained > 0 {
                tracing::info!("🧵 [QUEUE] {} drained {} jobs", name, drained);
            }
        } else {
            let mut discarded = 0u64;
            while receiver.try_recv().is_ok() {
                discarded += 1;
            }
            stats.dropped.fetch_add(discarded, Ordering::Relaxed);
            if discarded > 0 {
                tracing::warn!("⚠️ [QUEUE] {} discarded {} jobs", name, discarded);
            }
        }

        tracing::info!("🧵 [QUEUE] {} worker stopped", name);
    }
}

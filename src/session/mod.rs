//! チャンネルごとのチャットセッション
//!
//! 1つのWebSocket接続を維持し、キープアライブ・受信・デコードの3つの処理を並行実行する。
//! 接続が切れた場合は配信がライブである限り再接続を続ける。

pub mod frame_buffer;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::{BufferConfig, SessionConfig};
use crate::context::ChannelContext;
use crate::decoder::Normalizer;
use crate::error::HighliveResult;
use crate::models::ChatEvent;
use crate::platform::{ChatPlatform, Decoded, WsStream};

pub use frame_buffer::FrameBuffer;

type WsSink = Arc<AsyncMutex<SplitSink<WsStream, Message>>>;

/// オフライン時に状態変化を待つ最大時間
const OFFLINE_RECHECK: Duration = Duration::from_secs(5);
/// 受信→デコード間のバッチキュー容量
const BATCH_QUEUE_CAPACITY: usize = 64;

/// 接続が終了した理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// 配信終了後、猶予時間が過ぎた
    Offline,
    /// 外部から再接続を要求された
    ForcedRejoin,
    ClosedByPeer,
    KeepaliveTimeout,
    /// 下流（分析タスク）が閉じた
    PipelineClosed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Duty {
    Keepalive,
    Receive,
}

pub struct Session {
    ctx: Arc<ChannelContext>,
    platform: Arc<dyn ChatPlatform>,
    normalizer: Arc<Mutex<Normalizer>>,
    events: mpsc::Sender<ChatEvent>,
    config: SessionConfig,
    buffer: BufferConfig,
}

impl Session {
    pub fn new(
        ctx: Arc<ChannelContext>,
        platform: Arc<dyn ChatPlatform>,
        normalizer: Normalizer,
        events: mpsc::Sender<ChatEvent>,
        config: SessionConfig,
        buffer: BufferConfig,
    ) -> Self {
        Self {
            ctx,
            platform,
            // 重複除去の窓は再接続をまたいで維持する
            normalizer: Arc::new(Mutex::new(normalizer)),
            events,
            config,
            buffer,
        }
    }

    /// セッションの生存期間中ブロックする
    ///
    /// 配信がオフライン（またはパスワード付き）の間は接続しない。
    /// 接続が終わるたびに短い待ち時間の後、ハンドシェイクからやり直す。
    pub async fn run(self) {
        let channel = self.ctx.channel_id.clone();
        let mut status_rx = self.ctx.subscribe_status();
        info!(
            "🚀 [SESSION] start: channel={} platform={}",
            channel, self.ctx.platform
        );

        loop {
            if self.ctx.cancel.is_cancelled() {
                break;
            }

            let status = self.ctx.status();
            if !self.platform.is_live(&status) {
                trace!("💤 [SESSION] not joinable yet: channel={}", channel);
                tokio::select! {
                    _ = self.ctx.cancel.cancelled() => break,
                    _ = status_rx.changed() => {}
                    _ = tokio::time::sleep(OFFLINE_RECHECK) => {}
                }
                continue;
            }

            let connected = tokio::select! {
                _ = self.ctx.cancel.cancelled() => break,
                result = self.platform.connect(&status) => result,
            };

            match connected {
                Ok(ws) => {
                    let reason = self.run_connection(ws).await;
                    if reason == CloseReason::Cancelled {
                        break;
                    }
                    info!(
                        "🔌 [SESSION] connection closed: channel={} reason={:?}",
                        channel, reason
                    );
                }
                Err(e) => {
                    warn!("⚠️ [SESSION] connect failed: channel={} error={}", channel, e);
                }
            }

            let delay = self.reconnect_delay();
            tokio::select! {
                _ = self.ctx.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("🛑 [SESSION] stopped: channel={}", channel);
    }

    fn reconnect_delay(&self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0..500);
        Duration::from_secs(self.config.reconnect_delay_secs) + Duration::from_millis(jitter)
    }

    /// 1接続分の3処理を起動し、キープアライブか受信が終わるまで待つ
    async fn run_connection(&self, ws: WsStream) -> CloseReason {
        let (sink, stream) = ws.split();
        let sink: WsSink = Arc::new(AsyncMutex::new(sink));
        let token = self.ctx.cancel.child_token();
        let (batch_tx, batch_rx) = mpsc::channel(BATCH_QUEUE_CAPACITY);

        let mut keepalive = tokio::spawn(keepalive_duty(
            self.platform.clone(),
            sink.clone(),
            self.config.keepalive_interval(),
            token.clone(),
        ));
        let mut receive = tokio::spawn(receive_duty(
            self.ctx.clone(),
            stream,
            batch_tx,
            self.config.clone(),
            self.buffer.clone(),
            token.clone(),
        ));
        let decode = tokio::spawn(decode_duty(
            self.ctx.clone(),
            self.platform.clone(),
            self.normalizer.clone(),
            batch_rx,
            self.events.clone(),
            sink.clone(),
            token.clone(),
        ));

        let (outcome, finished) = tokio::select! {
            res = &mut keepalive => (res, Duty::Keepalive),
            res = &mut receive => (res, Duty::Receive),
        };

        let reason = match outcome {
            Ok(Ok(reason)) => reason,
            Ok(Err(e)) => {
                warn!(
                    "⚠️ [SESSION] {:?} failed: channel={} error={}",
                    finished, self.ctx.channel_id, e
                );
                CloseReason::Failed
            }
            Err(e) => {
                error!(
                    "❌ [SESSION] {:?} task panicked: channel={} error={}",
                    finished, self.ctx.channel_id, e
                );
                CloseReason::Failed
            }
        };

        token.cancel();

        let cancel_timeout = self.config.cancel_timeout();
        if tokio::time::timeout(cancel_timeout, async { sink.lock().await.close().await })
            .await
            .is_err()
        {
            debug!("⏱️ [SESSION] close frame timed out: channel={}", self.ctx.channel_id);
        }

        let mut remaining = vec![("decode", decode)];
        if finished != Duty::Keepalive {
            remaining.push(("keepalive", keepalive));
        }
        if finished != Duty::Receive {
            remaining.push(("receive", receive));
        }
        self.shutdown_duties(remaining).await;

        reason
    }

    /// 停止済みトークンを受けて各処理が終わるのを待つ。1件ごとに時間制限付き
    async fn shutdown_duties(&self, duties: Vec<(&'static str, JoinHandle<HighliveResult<CloseReason>>)>) {
        let cancel_timeout = self.config.cancel_timeout();
        for (name, mut handle) in duties {
            match tokio::time::timeout(cancel_timeout, &mut handle).await {
                Ok(Ok(Ok(_))) => trace!("✅ [SESSION] {} stopped", name),
                Ok(Ok(Err(e))) => debug!("[SESSION] {} ended with error: {}", name, e),
                Ok(Err(e)) => warn!("⚠️ [SESSION] {} join error: {}", name, e),
                Err(_) => {
                    warn!(
                        "⏱️ [SESSION] {} did not stop within {:?}, aborting: channel={}",
                        name, cancel_timeout, self.ctx.channel_id
                    );
                    handle.abort();
                }
            }
        }
    }
}

/// 一定間隔でpingを送る。送信は間隔以上ブロックしない
async fn keepalive_duty(
    platform: Arc<dyn ChatPlatform>,
    sink: WsSink,
    interval: Duration,
    token: CancellationToken,
) -> HighliveResult<CloseReason> {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(CloseReason::Cancelled),
            _ = ticker.tick() => {
                let ping = platform.build_keepalive();
                let sent = tokio::time::timeout(interval, async {
                    sink.lock().await.send(ping).await
                })
                .await;
                match sent {
                    Ok(Ok(())) => trace!("💓 [SESSION] keepalive sent"),
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => return Ok(CloseReason::KeepaliveTimeout),
                }
            }
        }
    }
}

/// 短い読み取りタイムアウトで受信し、バッファ経由でデコード処理へ渡す
async fn receive_duty(
    ctx: Arc<ChannelContext>,
    mut stream: SplitStream<WsStream>,
    batch_tx: mpsc::Sender<Vec<Message>>,
    config: SessionConfig,
    buffer_config: BufferConfig,
    token: CancellationToken,
) -> HighliveResult<CloseReason> {
    let read_timeout = config.read_timeout();
    let grace = Duration::from_secs(config.offline_grace_secs);
    let mut buffer = FrameBuffer::new(
        buffer_config.batch_size,
        Duration::from_millis(buffer_config.flush_timeout_ms),
        Instant::now(),
    );
    let mut last_activity = Instant::now();

    let reason = loop {
        if ctx.take_rejoin() {
            break CloseReason::ForcedRejoin;
        }
        if !ctx.status().live && last_activity.elapsed() >= grace {
            break CloseReason::Offline;
        }

        let wait = buffer
            .time_until_flush(Instant::now())
            .map_or(read_timeout, |remaining| remaining.min(read_timeout));

        tokio::select! {
            _ = token.cancelled() => break CloseReason::Cancelled,
            next = tokio::time::timeout(wait, stream.next()) => match next {
                Ok(Some(Ok(message))) => {
                    last_activity = Instant::now();
                    match message {
                        Message::Close(_) => break CloseReason::ClosedByPeer,
                        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                        message => {
                            if let Some(batch) = buffer.push(message, last_activity) {
                                if batch_tx.send(batch).await.is_err() {
                                    break CloseReason::PipelineClosed;
                                }
                            }
                        }
                    }
                }
                Ok(Some(Err(e))) => {
                    if let Some(rest) = buffer.drain(Instant::now()) {
                        let _ = batch_tx.send(rest).await;
                    }
                    return Err(e.into());
                }
                Ok(None) => break CloseReason::ClosedByPeer,
                Err(_) => {
                    // アイドル中も保持分は古くなる前に流す
                    if let Some(batch) = buffer.poll_stale(Instant::now()) {
                        if batch_tx.send(batch).await.is_err() {
                            break CloseReason::PipelineClosed;
                        }
                    }
                }
            }
        }
    };

    if let Some(rest) = buffer.drain(Instant::now()) {
        let _ = batch_tx.send(rest).await;
    }
    Ok(reason)
}

/// バッチをデコード・正規化して分析タスクへ送る
async fn decode_duty(
    ctx: Arc<ChannelContext>,
    platform: Arc<dyn ChatPlatform>,
    normalizer: Arc<Mutex<Normalizer>>,
    mut batches: mpsc::Receiver<Vec<Message>>,
    events: mpsc::Sender<ChatEvent>,
    sink: WsSink,
    token: CancellationToken,
) -> HighliveResult<CloseReason> {
    loop {
        let batch = tokio::select! {
            biased;
            batch = batches.recv() => match batch {
                Some(batch) => batch,
                None => return Ok(CloseReason::ClosedByPeer),
            },
            _ = token.cancelled() => return Ok(CloseReason::Cancelled),
        };

        for message in batch {
            let frames = match platform.split_frames(&message) {
                Ok(frames) => frames,
                Err(e) => {
                    warn!("⚠️ [DECODER] dropped message: channel={} error={}", ctx.channel_id, e);
                    continue;
                }
            };

            for frame in frames {
                match platform.decode_frame(&frame) {
                    Ok(Decoded::Message(decoded)) => {
                        let event = normalizer.lock().normalize(decoded, frame.received_at);
                        if let Some(event) = event {
                            if events.send(event).await.is_err() {
                                return Ok(CloseReason::PipelineClosed);
                            }
                        }
                    }
                    Ok(Decoded::Reply(reply)) => {
                        sink.lock().await.send(reply).await?;
                    }
                    Ok(Decoded::Ignored) => {}
                    Err(e) if e.is_rejection() => {
                        trace!("[DECODER] rejected frame: channel={} reason={}", ctx.channel_id, e);
                    }
                    Err(e) => {
                        warn!("⚠️ [DECODER] malformed frame: channel={} error={}", ctx.channel_id, e);
                    }
                }
            }
        }
    }
}

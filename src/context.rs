//! チャンネル単位のコンテキスト
//!
//! スーパーバイザーがチャンネルごとに1つ生成し、セッション・分析タスクへ明示的に渡す。
//! チャンネル間で共有される可変状態は持たない。

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::models::{ChannelId, LiveStatus, PlatformKind, StreamSession};

pub struct ChannelContext {
    pub channel_id: ChannelId,
    pub channel_name: String,
    pub platform: PlatformKind,
    status: watch::Sender<LiveStatus>,
    force_rejoin: AtomicBool,
    /// 現在の配信（開始シグナルから終了シグナルまで）
    stream: Mutex<Option<StreamSession>>,
    /// チャンネル全体の停止トークン
    pub cancel: CancellationToken,
}

impl ChannelContext {
    pub fn new(channel_id: ChannelId, channel_name: impl Into<String>, platform: PlatformKind) -> Self {
        let (status, _) = watch::channel(LiveStatus::default());
        Self {
            channel_id,
            channel_name: channel_name.into(),
            platform,
            status,
            force_rejoin: AtomicBool::new(false),
            stream: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// 最新のライブ状態
    pub fn status(&self) -> LiveStatus {
        self.status.borrow().clone()
    }

    pub fn viewer_count(&self) -> u64 {
        self.status.borrow().viewer_count
    }

    pub fn subscribe_status(&self) -> watch::Receiver<LiveStatus> {
        self.status.subscribe()
    }

    pub fn update_status(&self, status: LiveStatus) {
        self.status.send_replace(status);
    }

    /// 次の受信ループで再接続させる
    pub fn request_rejoin(&self) {
        self.force_rejoin.store(true, Ordering::SeqCst);
    }

    /// 再接続要求を取り出してクリア
    pub fn take_rejoin(&self) -> bool {
        self.force_rejoin.swap(false, Ordering::SeqCst)
    }

    pub fn current_stream(&self) -> Option<StreamSession> {
        self.stream.lock().clone()
    }

    pub fn set_stream(&self, stream: Option<StreamSession>) {
        *self.stream.lock() = stream;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejoin_flag_is_consumed() {
        let ctx = ChannelContext::new(ChannelId::new("ch"), "name", PlatformKind::Soop);
        assert!(!ctx.take_rejoin());
        ctx.request_rejoin();
        assert!(ctx.take_rejoin());
        assert!(!ctx.take_rejoin());
    }

    #[test]
    fn test_status_update_is_visible_to_subscribers() {
        let ctx = ChannelContext::new(ChannelId::new("ch"), "name", PlatformKind::Chzzk);
        let rx = ctx.subscribe_status();
        ctx.update_status(LiveStatus {
            live: true,
            viewer_count: 120,
            ..Default::default()
        });
        assert!(rx.borrow().live);
        assert_eq!(ctx.viewer_count(), 120);
    }
}

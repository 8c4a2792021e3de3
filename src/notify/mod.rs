//! 通知配送
//!
//! ハイライトや監視対象ユーザーのチャットを外部の通知先へ届ける。
//! 送信はワークキュー経由で行い、分析の経路を待たせない。

pub mod dispatcher;
pub mod format;
pub mod registry;
pub mod transport;

pub use dispatcher::{DeliveryOutcome, DispatchReport, Dispatcher};
pub use registry::EndpointRegistry;
pub use transport::{NotificationTransport, PushTransport, WebhookTransport};

use std::sync::Arc;
use thiserror::Error;

use crate::models::{ChannelId, NotificationJob, NotificationPayload};
use crate::work_queue::{QueueError, WorkQueueHandle};

/// 配送失敗の分類
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// 通知先が存在しない。再試行せず登録を外す
    #[error("permanent failure (status {status})")]
    Permanent { status: u16 },
    /// タイムアウトや5xx。再試行する
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("delivery failed: {0}")]
    Other(String),
}

/// ハイライト通知の受信者集合
pub fn highlight_recipients(channel_id: &ChannelId) -> String {
    format!("highlight:{}", channel_id)
}

/// 監視対象ユーザーのチャット通知の受信者集合
pub fn chat_recipients(channel_id: &ChannelId) -> String {
    format!("chat:{}", channel_id)
}

/// 受信者集合へ通知ジョブを投入する
#[derive(Clone)]
pub struct Notifier {
    queue: WorkQueueHandle<NotificationJob>,
    registry: Arc<EndpointRegistry>,
}

impl Notifier {
    pub fn new(queue: WorkQueueHandle<NotificationJob>, registry: Arc<EndpointRegistry>) -> Self {
        Self { queue, registry }
    }

    /// 現在の通知先でジョブを作って投入する。通知先がなければ何もしない
    pub fn notify(
        &self,
        recipient_set: &str,
        payload: NotificationPayload,
    ) -> Result<bool, QueueError> {
        let targets = self.registry.endpoints(recipient_set);
        if targets.is_empty() {
            return Ok(false);
        }
        self.queue
            .try_enqueue(NotificationJob::new(recipient_set, targets, payload))?;
        Ok(true)
    }
}

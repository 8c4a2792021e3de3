//! 配信プラットフォームごとのチャットプロトコル
//!
//! 各プラットフォームは [`ChatPlatform`] を実装し、セッション生成時に一度だけ選択される。

pub mod chzzk;
pub mod soop;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::HighliveResult;
use crate::models::{ChannelId, LiveStatus, MessageKind, PlatformKind};

pub use chzzk::Chzzk;
pub use soop::Soop;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 受信したプラットフォームレコード1件
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub received_at: DateTime<Utc>,
    pub body: FrameBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    /// 区切り文字で分割されたフィールド列
    Fields(Vec<String>),
    Json(serde_json::Value),
}

impl RawFrame {
    pub fn fields(fields: Vec<String>) -> Self {
        Self {
            received_at: Utc::now(),
            body: FrameBody::Fields(fields),
        }
    }

    pub fn json(value: serde_json::Value) -> Self {
        Self {
            received_at: Utc::now(),
            body: FrameBody::Json(value),
        }
    }
}

/// フレームから取り出したメッセージ（正規化前）
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    pub author: String,
    pub nickname: String,
    pub text: String,
    pub kind: MessageKind,
    /// プラットフォームが送信時刻を持つ場合
    pub sent_at: Option<DateTime<Utc>>,
}

/// フレームのデコード結果
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(DecodedMessage),
    /// サーバーへ返信が必要な制御フレーム
    Reply(Message),
    /// チャット以外の正常なフレーム
    Ignored,
}

/// フレームを破棄した理由
#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("too few fields: {count}")]
    TooFewFields { count: usize },

    #[error("sentinel id field: {value:?}")]
    Sentinel { value: String },

    #[error("empty content")]
    EmptyContent,

    #[error("frame echoes broadcaster id")]
    BroadcasterEcho,

    #[error("system notice")]
    SystemNotice,

    #[error("unknown layout with {count} fields")]
    UnknownLayout { count: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl DecodeError {
    /// 構造上の想定内の破棄か（ログはtraceで十分）
    pub fn is_rejection(&self) -> bool {
        !matches!(self, DecodeError::Malformed(_))
    }
}

/// プラットフォームごとのチャットプロトコル
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    fn kind(&self) -> PlatformKind;

    /// 接続してjoinシーケンスまで完了させる
    async fn connect(&self, status: &LiveStatus) -> HighliveResult<WsStream>;

    /// キープアライブ用フレーム
    fn build_keepalive(&self) -> Message;

    /// WebSocketメッセージをレコード単位に分割
    fn split_frames(&self, message: &Message) -> Result<Vec<RawFrame>, DecodeError>;

    /// レコード1件を0件または1件のメッセージに変換
    fn decode_frame(&self, frame: &RawFrame) -> Result<Decoded, DecodeError>;

    /// チャットに参加できる状態か
    fn is_live(&self, status: &LiveStatus) -> bool;
}

/// プラットフォーム実装を選択
pub fn for_kind(kind: PlatformKind, channel_id: &ChannelId) -> Arc<dyn ChatPlatform> {
    match kind {
        PlatformKind::Soop => Arc::new(Soop::new(channel_id.clone())),
        PlatformKind::Chzzk => Arc::new(Chzzk::new(channel_id.clone())),
    }
}

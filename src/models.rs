//! コアデータモデル
//!
//! チャットイベント、分析スナップショット、ハイライト、配信セッションなど
//! パイプライン全体で受け渡す型を定義する。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// チャンネルID
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display, Serialize, Deserialize,
)]
pub struct ChannelId(pub String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// 配信プラットフォーム
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    /// SOOP (旧AfreecaTV)
    #[display("soop")]
    Soop,
    #[display("chzzk")]
    Chzzk,
}

/// チャット本文から抽出するタグ
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TagKind {
    #[display("laugh")]
    Laugh,
    #[display("excitement")]
    Excitement,
    #[display("surprise")]
    Surprise,
    #[display("reaction")]
    Reaction,
    #[display("greeting")]
    Greeting,
}

impl TagKind {
    pub const ALL: [TagKind; 5] = [
        TagKind::Laugh,
        TagKind::Excitement,
        TagKind::Surprise,
        TagKind::Reaction,
        TagKind::Greeting,
    ];
}

/// ウィンドウ内のタグ出現数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagCounts {
    pub laugh: u32,
    pub excitement: u32,
    pub surprise: u32,
    pub reaction: u32,
    pub greeting: u32,
}

impl TagCounts {
    pub fn add(&mut self, tag: TagKind) {
        *self.slot(tag) += 1;
    }

    pub fn get(&self, tag: TagKind) -> u32 {
        match tag {
            TagKind::Laugh => self.laugh,
            TagKind::Excitement => self.excitement,
            TagKind::Surprise => self.surprise,
            TagKind::Reaction => self.reaction,
            TagKind::Greeting => self.greeting,
        }
    }

    fn slot(&mut self, tag: TagKind) -> &mut u32 {
        match tag {
            TagKind::Laugh => &mut self.laugh,
            TagKind::Excitement => &mut self.excitement,
            TagKind::Surprise => &mut self.surprise,
            TagKind::Reaction => &mut self.reaction,
            TagKind::Greeting => &mut self.greeting,
        }
    }
}

/// メッセージ種別
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageKind {
    /// 通常チャット
    Chat,
    /// 投げ銭・後援
    Donation { amount: u64 },
    /// 定期購読
    Subscription { months: u32 },
    /// 購読ギフト
    Gift { count: u32 },
}

impl MessageKind {
    pub fn is_chat(&self) -> bool {
        matches!(self, MessageKind::Chat)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Chat => "chat",
            MessageKind::Donation { .. } => "donation",
            MessageKind::Subscription { .. } => "subscription",
            MessageKind::Gift { .. } => "gift",
        }
    }
}

/// 正規化済みチャットイベント（生成後は不変）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEvent {
    pub channel_id: ChannelId,
    /// 送信者ID
    pub author: String,
    /// 表示名
    pub nickname: String,
    pub text: String,
    pub occurred_at: DateTime<Utc>,
    pub kind: MessageKind,
    pub extracted_tags: BTreeSet<TagKind>,
}

impl ChatEvent {
    pub fn has_tag(&self, tag: TagKind) -> bool {
        self.extracted_tags.contains(&tag)
    }

    /// 挨拶だけのメッセージか
    pub fn is_greeting_only(&self) -> bool {
        self.extracted_tags.len() == 1 && self.has_tag(TagKind::Greeting)
    }
}

/// 4つのサブスコア（いずれも0〜100）
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Subscores {
    pub chat_spike: f64,
    pub reaction: f64,
    pub diversity: f64,
    pub viewer_trend: f64,
}

/// 1ティック分の分析結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSnapshot {
    pub timestamp: DateTime<Utc>,
    pub window_message_count: usize,
    pub viewer_count: u64,
    pub tag_counts: TagCounts,
    pub subscores: Subscores,
    pub fun_score: f64,
    pub is_highlight_candidate: bool,
    pub is_big_highlight: bool,
    pub score_delta_from_recent_min: f64,
    /// このティックが新しいハイライトを開いたか（後続ティックで取り消されうる）
    pub opens_new_highlight: bool,
}

/// 配信セッションのキー
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamSessionKey {
    pub channel_id: ChannelId,
    pub started_at: DateTime<Utc>,
}

impl std::fmt::Display for StreamSessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}_{}",
            self.channel_id,
            self.started_at.format("%Y%m%d%H%M%S")
        )
    }
}

/// 1回の配信
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSession {
    pub channel_id: ChannelId,
    pub channel_name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_known_title: String,
    /// プラットフォーム側の放送ID
    pub start_id: Option<String>,
    pub end_id: Option<String>,
}

impl StreamSession {
    pub fn new(
        channel_id: ChannelId,
        channel_name: impl Into<String>,
        started_at: DateTime<Utc>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            channel_id,
            channel_name: channel_name.into(),
            started_at,
            ended_at: None,
            last_known_title: title.into(),
            start_id: None,
            end_id: None,
        }
    }

    pub fn key(&self) -> StreamSessionKey {
        StreamSessionKey {
            channel_id: self.channel_id.clone(),
            started_at: self.started_at,
        }
    }
}

/// ハイライトのスコア内訳
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreDetails {
    pub subscores: Subscores,
    pub tag_counts: TagCounts,
    pub score_delta: f64,
    pub window_message_count: usize,
    pub viewer_count: u64,
}

/// 記録されたハイライト
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Highlight {
    pub session_id: String,
    /// ピークティックの時刻
    pub opened_at: DateTime<Utc>,
    pub peak_score: f64,
    pub reason: String,
    pub chat_context_sample: Vec<String>,
    pub duration_sec: i64,
    /// 配信開始からの経過秒
    pub vod_relative_timestamp: i64,
    pub is_big: bool,
    pub score_details: ScoreDetails,
}

/// ライブ状態（外部のポーラーが供給する）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveStatus {
    pub live: bool,
    #[serde(default)]
    pub password_protected: bool,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub viewer_count: u64,
    /// チャットルームID
    #[serde(default)]
    pub chat_channel_id: Option<String>,
    /// チャットサーバーURL
    #[serde(default)]
    pub chat_url: Option<String>,
    /// 放送ID
    #[serde(default)]
    pub broadcast_id: Option<String>,
    /// チャット接続用トークン
    #[serde(default)]
    pub access_token: Option<String>,
}

/// 通知の配送方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Webhook,
    Push,
}

/// 通知先
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub kind: TransportKind,
    pub url: String,
}

impl Endpoint {
    pub fn webhook(url: impl Into<String>) -> Self {
        Self {
            kind: TransportKind::Webhook,
            url: url.into(),
        }
    }

    pub fn push(url: impl Into<String>) -> Self {
        Self {
            kind: TransportKind::Push,
            url: url.into(),
        }
    }
}

/// 通知ペイロード
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// 配送ジョブ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationJob {
    /// 受信者集合（レジストリのキー）
    pub recipient_set: String,
    pub targets: Vec<Endpoint>,
    pub payload: NotificationPayload,
    pub idempotency_key: Uuid,
}

impl NotificationJob {
    pub fn new(
        recipient_set: impl Into<String>,
        targets: Vec<Endpoint>,
        payload: NotificationPayload,
    ) -> Self {
        Self {
            recipient_set: recipient_set.into(),
            targets,
            payload,
            idempotency_key: Uuid::new_v4(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_tag_counts() {
        let mut counts = TagCounts::default();
        counts.add(TagKind::Laugh);
        counts.add(TagKind::Laugh);
        counts.add(TagKind::Greeting);
        assert_eq!(counts.get(TagKind::Laugh), 2);
        assert_eq!(counts.get(TagKind::Greeting), 1);
        assert_eq!(counts.get(TagKind::Surprise), 0);
    }

    #[test]
    fn test_greeting_only() {
        let mut event = ChatEvent {
            channel_id: ChannelId::new("ch"),
            author: "a".into(),
            nickname: "a".into(),
            text: "안녕하세요".into(),
            occurred_at: Utc::now(),
            kind: MessageKind::Chat,
            extracted_tags: BTreeSet::from([TagKind::Greeting]),
        };
        assert!(event.is_greeting_only());

        event.extracted_tags.insert(TagKind::Laugh);
        assert!(!event.is_greeting_only());
    }

    #[test]
    fn test_session_key_display() {
        let started_at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let session = StreamSession::new(ChannelId::new("bj"), "name", started_at, "title");
        assert_eq!(session.key().to_string(), "bj_20240501123000");
    }

    #[test]
    fn test_message_kind_serialization() {
        let json = serde_json::to_string(&MessageKind::Donation { amount: 1000 }).unwrap();
        assert_eq!(json, r#"{"type":"donation","amount":1000}"#);
        assert_eq!(PlatformKind::Soop.to_string(), "soop");
    }
}

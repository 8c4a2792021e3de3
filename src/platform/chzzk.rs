//! Chzzk チャットプロトコル（JSONフレーム）

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

use super::{ChatPlatform, DecodeError, Decoded, DecodedMessage, FrameBody, RawFrame, WsStream};
use crate::error::{HighliveError, HighliveResult};
use crate::models::{ChannelId, LiveStatus, MessageKind, PlatformKind};

const DEFAULT_CHAT_URL: &str = "wss://kr-ss3.chat.naver.com/chat";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const RECENT_MESSAGE_COUNT: u32 = 50;

/// コマンド番号
mod cmd {
    pub const PING: i64 = 0;
    pub const PONG: i64 = 10000;
    pub const CONNECT: i64 = 100;
    pub const CONNECTED: i64 = 10100;
    pub const REQUEST_RECENT_CHAT: i64 = 5101;
    pub const RECENT_CHAT: i64 = 15101;
    pub const CHAT: i64 = 93101;
    pub const DONATION: i64 = 93102;
}

/// メッセージ種別コード
mod msg_type {
    pub const CHAT: i64 = 1;
    pub const DONATION: i64 = 10;
    pub const SUBSCRIPTION: i64 = 11;
    pub const GIFT: i64 = 12;
    pub const SYSTEM: i64 = 30;
}

pub struct Chzzk {
    channel_id: ChannelId,
}

impl Chzzk {
    pub fn new(channel_id: ChannelId) -> Self {
        Self { channel_id }
    }

    fn pong() -> Message {
        Message::Text(json!({"ver": "2", "cmd": cmd::PONG}).to_string())
    }

    fn connect_request(chat_channel_id: &str, access_token: &str) -> Value {
        json!({
            "ver": "2",
            "svcid": "game",
            "cid": chat_channel_id,
            "cmd": cmd::CONNECT,
            "tid": 1,
            "bdy": {
                "uid": null,
                "devType": 2001,
                "accTkn": access_token,
                "auth": "READ"
            }
        })
    }

    fn recent_chat_request(chat_channel_id: &str, sid: &str) -> Value {
        json!({
            "ver": "2",
            "svcid": "game",
            "cid": chat_channel_id,
            "cmd": cmd::REQUEST_RECENT_CHAT,
            "tid": 2,
            "sid": sid,
            "bdy": { "recentMessageCount": RECENT_MESSAGE_COUNT }
        })
    }

    /// `profile` / `extras` は文字列化されたJSONで届くことがある
    fn nested_object(value: Option<&Value>) -> Value {
        match value {
            Some(Value::String(s)) if s != "null" => {
                serde_json::from_str(s).unwrap_or(Value::Null)
            }
            Some(obj @ Value::Object(_)) => obj.clone(),
            _ => Value::Null,
        }
    }

    fn decode_chat(chat: &Value) -> Result<Decoded, DecodeError> {
        let type_code = chat
            .get("msgTypeCode")
            .or_else(|| chat.get("messageTypeCode"))
            .and_then(Value::as_i64)
            .unwrap_or(msg_type::CHAT);

        let extras = Self::nested_object(chat.get("extras"));
        let kind = match type_code {
            msg_type::CHAT => MessageKind::Chat,
            msg_type::DONATION => MessageKind::Donation {
                amount: extras["payAmount"].as_u64().unwrap_or(0),
            },
            msg_type::SUBSCRIPTION => MessageKind::Subscription {
                months: extras["month"].as_u64().unwrap_or(1) as u32,
            },
            msg_type::GIFT => MessageKind::Gift {
                count: extras["quantity"].as_u64().unwrap_or(1) as u32,
            },
            msg_type::SYSTEM => return Err(DecodeError::SystemNotice),
            _ => return Ok(Decoded::Ignored),
        };

        let text = chat
            .get("msg")
            .or_else(|| chat.get("content"))
            .and_then(Value::as_str)
            .ok_or(DecodeError::EmptyContent)?;

        let author = chat
            .get("uid")
            .or_else(|| chat.get("userId"))
            .and_then(Value::as_str)
            .unwrap_or("anonymous");

        let profile = Self::nested_object(chat.get("profile"));
        let nickname = profile["nickname"].as_str().unwrap_or(author);

        let sent_at = chat
            .get("msgTime")
            .or_else(|| chat.get("messageTime"))
            .and_then(Value::as_i64)
            .and_then(DateTime::<Utc>::from_timestamp_millis);

        Ok(Decoded::Message(DecodedMessage {
            author: author.to_string(),
            nickname: nickname.to_string(),
            text: text.to_string(),
            kind,
            sent_at,
        }))
    }
}

#[async_trait]
impl ChatPlatform for Chzzk {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Chzzk
    }

    async fn connect(&self, status: &LiveStatus) -> HighliveResult<WsStream> {
        let chat_channel_id = status
            .chat_channel_id
            .as_deref()
            .ok_or_else(|| HighliveError::protocol("Chzzk chatChannelId is not known yet"))?;
        let access_token = status
            .access_token
            .as_deref()
            .ok_or_else(|| HighliveError::protocol("Chzzk access token is missing"))?;
        let url = status.chat_url.as_deref().unwrap_or(DEFAULT_CHAT_URL);

        let (mut ws, _) = tokio_tungstenite::connect_async(url).await?;

        ws.send(Message::Text(
            Self::connect_request(chat_channel_id, access_token).to_string(),
        ))
        .await?;

        // 接続応答からsidを得る
        let sid = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            while let Some(message) = ws.next().await {
                let Message::Text(text) = message? else {
                    continue;
                };
                let value: Value = serde_json::from_str(&text)?;
                if value["cmd"].as_i64() == Some(cmd::CONNECTED) {
                    return value["bdy"]["sid"]
                        .as_str()
                        .map(str::to_string)
                        .ok_or_else(|| HighliveError::protocol("connect response has no sid"));
                }
            }
            Err(HighliveError::protocol("closed during handshake"))
        })
        .await
        .map_err(|_| HighliveError::protocol("handshake timed out"))??;

        ws.send(Message::Text(
            Self::recent_chat_request(chat_channel_id, &sid).to_string(),
        ))
        .await?;

        tracing::info!(
            "🔌 [CHZZK] joined chat: channel={} cid={}",
            self.channel_id,
            chat_channel_id
        );
        Ok(ws)
    }

    fn build_keepalive(&self) -> Message {
        Self::pong()
    }

    fn split_frames(&self, message: &Message) -> Result<Vec<RawFrame>, DecodeError> {
        let Message::Text(text) = message else {
            return Ok(Vec::new());
        };

        let value: Value =
            serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let received_at = Utc::now();
        let command = value["cmd"].as_i64().unwrap_or(-1);

        let chats = match command {
            cmd::CHAT | cmd::DONATION => value["bdy"].as_array(),
            cmd::RECENT_CHAT => value["bdy"]["messageList"].as_array(),
            _ => None,
        };

        let frames = match chats {
            Some(list) => list
                .iter()
                .map(|chat| RawFrame {
                    received_at,
                    body: FrameBody::Json(json!({"cmd": command, "chat": chat})),
                })
                .collect(),
            None => vec![RawFrame {
                received_at,
                body: FrameBody::Json(value),
            }],
        };
        Ok(frames)
    }

    fn decode_frame(&self, frame: &RawFrame) -> Result<Decoded, DecodeError> {
        let value = match &frame.body {
            FrameBody::Json(value) => value,
            FrameBody::Fields(_) => {
                return Err(DecodeError::Malformed("unexpected field frame".into()))
            }
        };

        match value["cmd"].as_i64() {
            Some(cmd::PING) => Ok(Decoded::Reply(Self::pong())),
            Some(cmd::CHAT | cmd::DONATION | cmd::RECENT_CHAT) => match value.get("chat") {
                Some(chat) => Self::decode_chat(chat),
                None => Ok(Decoded::Ignored),
            },
            Some(_) => {
                if value["bdy"]["type"].as_str() == Some("TEMPORARY_RESTRICT") {
                    tracing::warn!(
                        "⏳ [CHZZK] temporary restriction: channel={} duration={}",
                        self.channel_id,
                        value["bdy"]["duration"]
                    );
                }
                Ok(Decoded::Ignored)
            }
            None => Err(DecodeError::Malformed("missing cmd".into())),
        }
    }

    fn is_live(&self, status: &LiveStatus) -> bool {
        status.live && status.chat_channel_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chzzk() -> Chzzk {
        Chzzk::new(ChannelId::new("channel"))
    }

    #[test]
    fn test_ping_is_answered_with_pong() {
        let frame = RawFrame::json(json!({"ver": "2", "cmd": 0}));
        match chzzk().decode_frame(&frame).unwrap() {
            Decoded::Reply(Message::Text(text)) => {
                let value: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(value["cmd"], 10000);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_split_chat_list() {
        let message = Message::Text(
            json!({
                "cmd": 93101,
                "bdy": [
                    {"uid": "a", "msg": "ㅋㅋㅋ", "msgTypeCode": 1},
                    {"uid": "b", "msg": "대박", "msgTypeCode": 1}
                ]
            })
            .to_string(),
        );
        let frames = chzzk().split_frames(&message).unwrap();
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn test_decode_chat_with_string_profile() {
        let frame = RawFrame::json(json!({
            "cmd": 93101,
            "chat": {
                "uid": "user1",
                "msg": "안녕",
                "msgTypeCode": 1,
                "msgTime": 1714566600000i64,
                "profile": "{\"nickname\":\"시청자\"}"
            }
        }));

        match chzzk().decode_frame(&frame).unwrap() {
            Decoded::Message(msg) => {
                assert_eq!(msg.author, "user1");
                assert_eq!(msg.nickname, "시청자");
                assert_eq!(msg.kind, MessageKind::Chat);
                assert!(msg.sent_at.is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_donation() {
        let frame = RawFrame::json(json!({
            "cmd": 93102,
            "chat": {
                "uid": "donor",
                "msg": "응원해요",
                "msgTypeCode": 10,
                "extras": "{\"payAmount\":1000}",
                "profile": "null"
            }
        }));

        match chzzk().decode_frame(&frame).unwrap() {
            Decoded::Message(msg) => {
                assert_eq!(msg.kind, MessageKind::Donation { amount: 1000 });
                assert_eq!(msg.nickname, "donor");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_system_message_rejected() {
        let frame = RawFrame::json(json!({
            "cmd": 93101,
            "chat": {"uid": "x", "msg": "restricted", "msgTypeCode": 30}
        }));
        assert_eq!(
            chzzk().decode_frame(&frame),
            Err(DecodeError::SystemNotice)
        );
    }

    #[test]
    fn test_malformed_json() {
        let message = Message::Text("{not json".to_string());
        assert!(matches!(
            chzzk().split_frames(&message),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_unknown_command_is_ignored() {
        let frame = RawFrame::json(json!({"cmd": 93006, "bdy": {}}));
        assert_eq!(chzzk().decode_frame(&frame), Ok(Decoded::Ignored));
    }
}

//! SOOP (旧AfreecaTV) チャットプロトコル
//!
//! フレームは `\x0c` 区切りのフィールド列。フィールド数でレイアウトが決まる。

use async_trait::async_trait;
use chrono::Utc;
use futures_util::SinkExt;
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use super::{ChatPlatform, DecodeError, Decoded, DecodedMessage, FrameBody, RawFrame, WsStream};
use crate::error::{HighliveError, HighliveResult};
use crate::models::{ChannelId, LiveStatus, MessageKind, PlatformKind};

const FIELD_SEPARATOR: char = '\x0c';
const ESCAPE: &str = "\x1b\t";

/// ID欄に現れる無効値
const SENTINEL_IDS: [&str; 3] = ["-1", "", "1"];

/// CONNECT送信後、JOINまでの待ち時間
const JOIN_DELAY: Duration = Duration::from_secs(2);

pub struct Soop {
    /// 配信者ID
    broadcaster_id: ChannelId,
}

impl Soop {
    pub fn new(broadcaster_id: ChannelId) -> Self {
        Self { broadcaster_id }
    }

    fn ping_packet() -> String {
        format!("{ESCAPE}000000000100{FIELD_SEPARATOR}")
    }

    fn connect_packet() -> String {
        let f = FIELD_SEPARATOR;
        format!("{ESCAPE}000100000600{f}{f}{f}16{f}")
    }

    fn join_packet(chat_no: &str) -> String {
        let f = FIELD_SEPARATOR;
        let body_len = chat_no.len() + 6;
        format!("{ESCAPE}0002{body_len:06}00{f}{chat_no}{f}{f}{f}{f}{f}")
    }

    /// 構造的に無効なフレームを弾く
    fn validate(&self, fields: &[String]) -> Result<(), DecodeError> {
        let count = fields.len();
        if count <= 10 {
            return Err(DecodeError::TooFewFields { count });
        }

        let lead = fields[1].as_str();
        let sender = fields[2].as_str();
        let broadcaster = self.broadcaster_id.as_str();

        if SENTINEL_IDS.contains(&lead) {
            return Err(DecodeError::Sentinel {
                value: lead.to_string(),
            });
        }
        if sender.is_empty() || sender == "1" {
            return Err(DecodeError::Sentinel {
                value: sender.to_string(),
            });
        }
        if lead == broadcaster || (sender == broadcaster && count == 11) {
            return Err(DecodeError::BroadcasterEcho);
        }
        if sender.contains("fw") {
            return Err(DecodeError::SystemNotice);
        }
        Ok(())
    }

    fn field(fields: &[String], index: usize) -> Result<&str, DecodeError> {
        fields
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| DecodeError::Malformed(format!("missing field {index}")))
    }
}

#[async_trait]
impl ChatPlatform for Soop {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Soop
    }

    async fn connect(&self, status: &LiveStatus) -> HighliveResult<WsStream> {
        let url = status
            .chat_url
            .as_deref()
            .ok_or_else(|| HighliveError::protocol("SOOP chat url is not known yet"))?;
        let chat_no = status
            .chat_channel_id
            .as_deref()
            .ok_or_else(|| HighliveError::protocol("SOOP chat number is not known yet"))?;

        let mut request = url.into_client_request()?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("chat"));

        let (mut ws, _) = tokio_tungstenite::connect_async(request).await?;

        ws.send(Message::Text(Self::connect_packet())).await?;
        tokio::time::sleep(JOIN_DELAY).await;
        ws.send(Message::Text(Self::join_packet(chat_no))).await?;

        tracing::info!(
            "🔌 [SOOP] joined chat: channel={} chat_no={}",
            self.broadcaster_id,
            chat_no
        );
        Ok(ws)
    }

    fn build_keepalive(&self) -> Message {
        Message::Text(Self::ping_packet())
    }

    fn split_frames(&self, message: &Message) -> Result<Vec<RawFrame>, DecodeError> {
        let text = match message {
            Message::Binary(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            Message::Text(text) => text.clone(),
            _ => return Ok(Vec::new()),
        };

        let fields = text.split(FIELD_SEPARATOR).map(str::to_string).collect();
        Ok(vec![RawFrame {
            received_at: Utc::now(),
            body: FrameBody::Fields(fields),
        }])
    }

    fn decode_frame(&self, frame: &RawFrame) -> Result<Decoded, DecodeError> {
        let fields = match &frame.body {
            FrameBody::Fields(fields) => fields,
            FrameBody::Json(_) => {
                return Err(DecodeError::Malformed("unexpected JSON frame".into()))
            }
        };

        self.validate(fields)?;

        let (author, text, nickname, kind) = match fields.len() {
            14 => (
                Self::field(fields, 2)?,
                Self::field(fields, 1)?,
                Self::field(fields, 6)?,
                MessageKind::Chat,
            ),
            19 => (
                Self::field(fields, 6)?,
                Self::field(fields, 2)?,
                Self::field(fields, 7)?,
                MessageKind::Chat,
            ),
            18 => (
                Self::field(fields, 3)?,
                Self::field(fields, 7)?,
                Self::field(fields, 4)?,
                MessageKind::Donation {
                    amount: Self::field(fields, 5)?.parse().unwrap_or(0),
                },
            ),
            17 => (
                Self::field(fields, 2)?,
                Self::field(fields, 16)?,
                Self::field(fields, 3)?,
                MessageKind::Gift {
                    count: Self::field(fields, 4)?.parse().unwrap_or(1),
                },
            ),
            count => return Err(DecodeError::UnknownLayout { count }),
        };

        // "id(2)" のような接尾辞を落とす
        let author = author.split('(').next().unwrap_or(author);

        Ok(Decoded::Message(DecodedMessage {
            author: author.to_string(),
            nickname: nickname.to_string(),
            text: text.to_string(),
            kind,
            sent_at: None,
        }))
    }

    fn is_live(&self, status: &LiveStatus) -> bool {
        status.live && !status.password_protected
    }
}

//! フレームの正規化
//!
//! プラットフォームがデコードしたメッセージをスパム除去・重複除去したうえで
//! タグ付きの [`ChatEvent`] に変換する。

pub mod tags;

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::config::DecoderConfig;
use crate::models::{ChannelId, ChatEvent};
use crate::platform::DecodedMessage;

pub use tags::TagClassifier;

/// 重複判定キー (author, text, 秒)
type DedupKey = (String, String, i64);

/// 直近に受理したキーを保持する小さなLRU風リスト
#[derive(Debug)]
pub struct DedupWindow {
    keys: VecDeque<DedupKey>,
    capacity: usize,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            keys: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// 新規ならtrueを返して記録する
    pub fn check_and_insert(&mut self, author: &str, text: &str, at: DateTime<Utc>) -> bool {
        let key = (author.to_string(), text.to_string(), at.timestamp());
        if self.keys.contains(&key) {
            return false;
        }
        if self.keys.len() >= self.capacity {
            self.keys.pop_front();
        }
        self.keys.push_back(key);
        true
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// チャンネル単位の正規化器
pub struct Normalizer {
    channel_id: ChannelId,
    classifier: Arc<TagClassifier>,
    spam_markers: Vec<String>,
    dedup: DedupWindow,
}

impl Normalizer {
    pub fn new(channel_id: ChannelId, classifier: Arc<TagClassifier>, config: &DecoderConfig) -> Self {
        Self {
            channel_id,
            classifier,
            spam_markers: config.spam_markers.clone(),
            dedup: DedupWindow::new(config.dedup_capacity),
        }
    }

    fn is_spam(&self, text: &str) -> bool {
        self.spam_markers
            .iter()
            .any(|marker| !marker.is_empty() && text.contains(marker.as_str()))
    }

    /// デコード済みメッセージを `ChatEvent` に変換する。破棄した場合は `None`
    pub fn normalize(&mut self, message: DecodedMessage, received_at: DateTime<Utc>) -> Option<ChatEvent> {
        let text = message.text.trim();
        if text.is_empty() && message.kind.is_chat() {
            return None;
        }

        if self.is_spam(text) {
            tracing::debug!("🚫 [DECODER] spam dropped: channel={}", self.channel_id);
            return None;
        }

        let occurred_at = message.sent_at.unwrap_or(received_at);
        if !self.dedup.check_and_insert(&message.author, text, occurred_at) {
            tracing::debug!(
                "🔁 [DECODER] duplicate dropped: channel={} author={}",
                self.channel_id,
                message.author
            );
            return None;
        }

        let extracted_tags = if message.kind.is_chat() {
            self.classifier.classify(text)
        } else {
            Default::default()
        };

        Some(ChatEvent {
            channel_id: self.channel_id.clone(),
            author: message.author,
            nickname: message.nickname,
            text: text.to_string(),
            occurred_at,
            kind: message.kind,
            extracted_tags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageKind, TagKind};
    use chrono::{Duration, TimeZone};

    fn message(author: &str, text: &str) -> DecodedMessage {
        DecodedMessage {
            author: author.to_string(),
            nickname: author.to_string(),
            text: text.to_string(),
            kind: MessageKind::Chat,
            sent_at: None,
        }
    }

    fn normalizer() -> Normalizer {
        Normalizer::new(
            ChannelId::new("ch"),
            Arc::new(TagClassifier::new()),
            &DecoderConfig::default(),
        )
    }

    #[test]
    fn test_normalize_extracts_tags() {
        let mut normalizer = normalizer();
        let event = normalizer.normalize(message("a", "ㅋㅋㅋㅋ"), Utc::now()).unwrap();
        assert!(event.has_tag(TagKind::Laugh));
        assert_eq!(event.channel_id, ChannelId::new("ch"));
    }

    #[test]
    fn test_duplicate_in_same_second_is_dropped() {
        let mut normalizer = normalizer();
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        assert!(normalizer.normalize(message("x", "hi"), at).is_some());
        assert!(normalizer
            .normalize(message("x", "hi"), at + Duration::milliseconds(300))
            .is_none());
    }

    #[test]
    fn test_duplicate_accepted_after_window_rolls_over() {
        let mut normalizer = normalizer();
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        assert!(normalizer.normalize(message("x", "hi"), at).is_some());
        for i in 0..20 {
            assert!(normalizer
                .normalize(message(&format!("other{i}"), "filler"), at)
                .is_some());
        }
        assert!(normalizer.normalize(message("x", "hi"), at).is_some());
    }

    #[test]
    fn test_spam_marker_dropped() {
        let mut normalizer = normalizer();
        assert!(normalizer
            .normalize(message("a", "buy at smartstore.naver.com/x"), Utc::now())
            .is_none());
    }

    #[test]
    fn test_donation_keeps_no_tags() {
        let mut normalizer = normalizer();
        let mut donation = message("a", "ㅋㅋㅋ");
        donation.kind = MessageKind::Donation { amount: 500 };
        let event = normalizer.normalize(donation, Utc::now()).unwrap();
        assert!(event.extracted_tags.is_empty());
    }

    #[test]
    fn test_dedup_window_capacity() {
        let mut window = DedupWindow::new(2);
        let at = Utc::now();
        assert!(window.check_and_insert("a", "1", at));
        assert!(window.check_and_insert("a", "2", at));
        assert!(window.check_and_insert("a", "3", at));
        assert_eq!(window.len(), 2);
        // "1" は押し出されている
        assert!(window.check_and_insert("a", "1", at));
    }
}

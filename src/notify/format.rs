//! 通知本文の組み立て

use serde_json::json;

use crate::models::{ChatEvent, Highlight, MessageKind, NotificationPayload};

/// ハイライト通知の埋め込み色
const HIGHLIGHT_COLOR: u32 = 0xF1C40F;
const BIG_HIGHLIGHT_COLOR: u32 = 0xE74C3C;

/// メッセージ種別ごとの本文
pub fn message_body(event: &ChatEvent) -> String {
    match &event.kind {
        MessageKind::Chat => event.text.clone(),
        MessageKind::Donation { amount } => {
            if event.text.is_empty() {
                format!("💰 {}개 후원", amount)
            } else {
                format!("💰 {}개 후원: {}", amount, event.text)
            }
        }
        MessageKind::Subscription { months } => format!("⭐ {}개월 구독", months),
        MessageKind::Gift { count } => format!("🎁 구독권 {}개 선물", count),
    }
}

/// 監視対象ユーザーのチャット通知
pub fn chat_payload(channel_name: &str, event: &ChatEvent) -> NotificationPayload {
    let title = format!("{} >> {}", event.nickname, channel_name);
    let body = message_body(event);
    NotificationPayload {
        data: json!({
            "username": title,
            "content": body,
        }),
        title,
        body,
    }
}

/// ハイライト通知
pub fn highlight_payload(
    channel_name: &str,
    stream_title: &str,
    highlight: &Highlight,
) -> NotificationPayload {
    let label = if highlight.is_big {
        "🔥 대형 하이라이트"
    } else {
        "🎉 하이라이트"
    };
    let title = format!("{} {}", channel_name, label);
    let body = format!(
        "재미도: {:.0}/100 ({})",
        highlight.peak_score, highlight.reason
    );
    let color = if highlight.is_big {
        BIG_HIGHLIGHT_COLOR
    } else {
        HIGHLIGHT_COLOR
    };

    NotificationPayload {
        data: json!({
            "username": channel_name,
            "embeds": [{
                "color": color,
                "title": format!("{}\n{}", title, body),
                "fields": [
                    {"name": "방제", "value": stream_title, "inline": true},
                    {
                        "name": ":busts_in_silhouette: 시청자수",
                        "value": highlight.score_details.viewer_count.to_string(),
                        "inline": true
                    },
                ],
                "description": highlight.chat_context_sample.join("\n"),
                "timestamp": highlight.opened_at.to_rfc3339(),
            }],
        }),
        title,
        body,
    }
}

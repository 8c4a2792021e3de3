//! ハイライトの要約
//!
//! 保留ハイライトをファイルに書くコメントへ変換する。外部の要約サービスを
//! 使う実装と、オフラインで動く基本実装がある。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::store::HighlightComment;
use crate::config::SummarizerConfig;
use crate::error::{HighliveError, HighliveResult};
use crate::models::{Highlight, StreamSession};

/// 面白さレベルのしきい値（スコア差）
const FUN_LEVEL_THRESHOLDS: [f64; 5] = [15.0, 30.0, 40.0, 60.0, 70.0];

/// スコア差から0〜5の面白さレベルを求める
pub fn fun_level(score_difference: f64) -> u8 {
    FUN_LEVEL_THRESHOLDS
        .iter()
        .filter(|threshold| score_difference >= **threshold)
        .count() as u8
}

/// 経過秒を "HH:MM:SS" に整形
pub fn format_vod_offset(seconds: i64) -> String {
    let seconds = seconds.max(0);
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn summarize(
        &self,
        session: &StreamSession,
        highlights: &[Highlight],
    ) -> HighliveResult<Vec<HighlightComment>>;
}

/// 理由文とチャット抜粋からコメントを作る
pub struct BasicSummarizer;

impl BasicSummarizer {
    fn comment_for(highlight: &Highlight) -> HighlightComment {
        let delta = highlight.score_details.score_delta;
        HighlightComment {
            comment_after_open_date: format_vod_offset(highlight.vod_relative_timestamp),
            text: highlight.reason.clone(),
            description: highlight.chat_context_sample.join(" / "),
            score_difference: delta,
            fun_level: fun_level(delta),
            peak_score: highlight.peak_score,
            is_big: highlight.is_big,
            vod_seconds: highlight.vod_relative_timestamp,
            chat_sample: highlight.chat_context_sample.clone(),
        }
    }
}

#[async_trait]
impl Summarizer for BasicSummarizer {
    fn name(&self) -> &'static str {
        "basic"
    }

    async fn summarize(
        &self,
        _session: &StreamSession,
        highlights: &[Highlight],
    ) -> HighliveResult<Vec<HighlightComment>> {
        Ok(highlights.iter().map(Self::comment_for).collect())
    }
}

#[derive(Debug, Serialize)]
struct SummaryRequest<'a> {
    channel_name: &'a str,
    stream_title: &'a str,
    highlights: Vec<SummaryRequestItem<'a>>,
}

#[derive(Debug, Serialize)]
struct SummaryRequestItem<'a> {
    #[serde(rename = "comment_after_openDate")]
    comment_after_open_date: String,
    score_difference: f64,
    peak_score: f64,
    reason: &'a str,
    chats: &'a [String],
}

#[derive(Debug, Deserialize)]
struct SummaryResponseItem {
    #[serde(rename = "comment_after_openDate")]
    comment_after_open_date: String,
    text: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    score_difference: Option<f64>,
}

/// 外部の要約サービスへ問い合わせる
pub struct HttpSummarizer {
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpSummarizer {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, timeout: Duration) -> HighliveResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: endpoint.into(),
            api_key,
            client,
        })
    }

    /// レスポンス本文をコメントに変換する。形式が違えばエラー
    fn parse_response(
        body: &str,
        highlights: &[Highlight],
    ) -> HighliveResult<Vec<HighlightComment>> {
        let items: Vec<SummaryResponseItem> = serde_json::from_str(body)
            .map_err(|e| HighliveError::Summarizer(format!("malformed summary: {}", e)))?;

        items
            .into_iter()
            .map(|item| {
                let source = highlights.iter().find(|h| {
                    format_vod_offset(h.vod_relative_timestamp) == item.comment_after_open_date
                });
                let vod_seconds = match source {
                    Some(h) => h.vod_relative_timestamp,
                    None => parse_vod_offset(&item.comment_after_open_date).ok_or_else(|| {
                        HighliveError::Summarizer(format!(
                            "invalid time: {}",
                            item.comment_after_open_date
                        ))
                    })?,
                };
                let score_difference = item
                    .score_difference
                    .or(source.map(|h| h.score_details.score_delta))
                    .unwrap_or(0.0);

                Ok(HighlightComment {
                    comment_after_open_date: item.comment_after_open_date,
                    text: item.text,
                    description: item.description,
                    score_difference,
                    fun_level: fun_level(score_difference),
                    peak_score: source.map(|h| h.peak_score).unwrap_or(0.0),
                    is_big: source.is_some_and(|h| h.is_big),
                    vod_seconds,
                    chat_sample: source
                        .map(|h| h.chat_context_sample.clone())
                        .unwrap_or_default(),
                })
            })
            .collect()
    }
}

fn parse_vod_offset(value: &str) -> Option<i64> {
    let parts: Vec<i64> = value
        .split(':')
        .map(|p| p.parse().ok())
        .collect::<Option<_>>()?;
    match parts.as_slice() {
        [h, m, s] => Some(h * 3600 + m * 60 + s),
        _ => None,
    }
}

#[async_trait]
impl Summarizer for HttpSummarizer {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn summarize(
        &self,
        session: &StreamSession,
        highlights: &[Highlight],
    ) -> HighliveResult<Vec<HighlightComment>> {
        let request = SummaryRequest {
            channel_name: &session.channel_name,
            stream_title: &session.last_known_title,
            highlights: highlights
                .iter()
                .map(|h| SummaryRequestItem {
                    comment_after_open_date: format_vod_offset(h.vod_relative_timestamp),
                    score_difference: h.score_details.score_delta,
                    peak_score: h.peak_score,
                    reason: &h.reason,
                    chats: &h.chat_context_sample,
                })
                .collect(),
        };

        let mut http_request = self.client.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            http_request = http_request.bearer_auth(key);
        }
        let response = http_request.send().await?;

        if !response.status().is_success() {
            return Err(HighliveError::Summarizer(format!(
                "summary request failed: status {}",
                response.status()
            )));
        }

        let body = response.text().await?;
        Self::parse_response(&body, highlights)
    }
}

/// 設定から要約器を選ぶ
pub fn from_config(config: &SummarizerConfig) -> HighliveResult<Arc<dyn Summarizer>> {
    match &config.endpoint {
        Some(endpoint) => {
            let timeout = Duration::from_secs(config.timeout_secs.unwrap_or(60));
            tracing::info!("📝 [SUMMARY] using endpoint {}", endpoint);
            Ok(Arc::new(HttpSummarizer::new(
                endpoint.clone(),
                config.api_key.clone(),
                timeout,
            )?))
        }
        None => Ok(Arc::new(BasicSummarizer)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChannelId, ScoreDetails, Subscores, TagCounts};
    use chrono::Utc;

    fn highlight(vod: i64, delta: f64) -> Highlight {
        Highlight {
            session_id: "bj_20240501200000".into(),
            opened_at: Utc::now(),
            peak_score: 60.0,
            reason: "big laugh".into(),
            chat_context_sample: vec!["a: ㅋㅋㅋ".into(), "b: ㅋㅋ".into()],
            duration_sec: 30,
            vod_relative_timestamp: vod,
            is_big: false,
            score_details: ScoreDetails {
                subscores: Subscores::default(),
                tag_counts: TagCounts::default(),
                score_delta: delta,
                window_message_count: 10,
                viewer_count: 100,
            },
        }
    }

    #[test]
    fn test_fun_level() {
        assert_eq!(fun_level(0.0), 0);
        assert_eq!(fun_level(15.0), 1);
        assert_eq!(fun_level(35.0), 2);
        assert_eq!(fun_level(65.0), 4);
        assert_eq!(fun_level(90.0), 5);
    }

    #[test]
    fn test_format_vod_offset() {
        assert_eq!(format_vod_offset(0), "00:00:00");
        assert_eq!(format_vod_offset(3725), "01:02:05");
        assert_eq!(parse_vod_offset("01:02:05"), Some(3725));
        assert_eq!(parse_vod_offset("1:2"), None);
    }

    #[tokio::test]
    async fn test_basic_summarizer() {
        let session = StreamSession::new(ChannelId::new("bj"), "BJ", Utc::now(), "");
        let comments = BasicSummarizer
            .summarize(&session, &[highlight(125, 32.0)])
            .await
            .unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].comment_after_open_date, "00:02:05");
        assert_eq!(comments[0].text, "big laugh");
        assert_eq!(comments[0].description, "a: ㅋㅋㅋ / b: ㅋㅋ");
        assert_eq!(comments[0].fun_level, 2);
    }

    #[test]
    fn test_parse_response() {
        let body = r#"[{"comment_after_openDate":"00:02:05","text":"역대급 장면","description":"설명"}]"#;
        let comments = HttpSummarizer::parse_response(body, &[highlight(125, 45.0)]).unwrap();
        assert_eq!(comments[0].text, "역대급 장면");
        assert_eq!(comments[0].score_difference, 45.0);
        assert_eq!(comments[0].vod_seconds, 125);
    }

    #[test]
    fn test_malformed_response_is_error() {
        let err = HttpSummarizer::parse_response("not json", &[]).unwrap_err();
        assert!(matches!(err, HighliveError::Summarizer(_)));

        let body = r#"[{"comment_after_openDate":"later","text":"x"}]"#;
        assert!(HttpSummarizer::parse_response(body, &[]).is_err());
    }
}

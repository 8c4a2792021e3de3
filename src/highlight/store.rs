//! ハイライトファイルの保存とマージ
//!
//! 配信ごとに1つのJSONファイルへ書き出す。同じ配信への再保存は
//! `(comment_after_openDate, text)` で重複を除いてマージするので、
//! 何度保存しても結果は同じになる。

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{HighliveError, HighliveResult};
use crate::models::{ChannelId, StreamSession};

/// 大型ハイライトとみなすスコア差
pub const BIG_HIGHLIGHT_DIFFERENCE: f64 = 70.0;

/// ハイライト1件分のコメント
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HighlightComment {
    /// 配信開始からの経過 "HH:MM:SS"
    #[serde(rename = "comment_after_openDate")]
    pub comment_after_open_date: String,
    pub text: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub score_difference: f64,
    #[serde(default)]
    pub fun_level: u8,
    #[serde(default)]
    pub peak_score: f64,
    #[serde(default)]
    pub is_big: bool,
    /// 並び替え用の経過秒
    #[serde(default)]
    pub vod_seconds: i64,
    #[serde(default)]
    pub chat_sample: Vec<String>,
}

impl HighlightComment {
    fn merge_key(&self) -> (String, String) {
        (self.comment_after_open_date.clone(), self.text.clone())
    }
}

/// スコア帯ごとの件数
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreRanges {
    #[serde(rename = "0-20")]
    pub range_0_20: usize,
    #[serde(rename = "21-40")]
    pub range_21_40: usize,
    #[serde(rename = "41-60")]
    pub range_41_60: usize,
    #[serde(rename = "61-80")]
    pub range_61_80: usize,
    #[serde(rename = "81-100")]
    pub range_81_100: usize,
}

impl ScoreRanges {
    fn add(&mut self, score: f64) {
        match score {
            s if s <= 20.0 => self.range_0_20 += 1,
            s if s <= 40.0 => self.range_21_40 += 1,
            s if s <= 60.0 => self.range_41_60 += 1,
            s if s <= 80.0 => self.range_61_80 += 1,
            _ => self.range_81_100 += 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HighlightStatistics {
    pub total_highlights: usize,
    pub total_with_scores: usize,
    pub avg_score: f64,
    pub max_score: f64,
    pub min_score: f64,
    pub big_highlights: usize,
    pub score_ranges: ScoreRanges,
}

/// ファイル内の時刻表記
const FILE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn file_time(at: DateTime<Utc>) -> String {
    at.format(FILE_TIME_FORMAT).to_string()
}

fn saved_stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// 配信1回分のハイライトファイル
///
/// 時刻は `YYYY-MM-DD HH:MM:SS` の文字列で、終了前の `stream_end_time` は空文字。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HighlightFile {
    pub channel_id: String,
    pub channel_name: String,
    #[serde(default)]
    pub stream_start_id: String,
    #[serde(default)]
    pub stream_end_id: String,
    #[serde(default)]
    pub stream_start_time: String,
    #[serde(default)]
    pub stream_end_time: String,
    #[serde(default)]
    pub last_title: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub saved_at: String,
    #[serde(default)]
    pub last_updated: String,
    #[serde(default)]
    pub update_count: u32,
    #[serde(default)]
    pub timeline_comments: Vec<HighlightComment>,
    #[serde(default)]
    pub statistics: HighlightStatistics,
}

impl HighlightFile {
    fn new(session: &StreamSession, now: DateTime<Utc>) -> Self {
        let stamp = saved_stamp(now);
        Self {
            channel_id: session.channel_id.to_string(),
            channel_name: session.channel_name.clone(),
            stream_start_id: session
                .start_id
                .clone()
                .unwrap_or_else(|| session.key().to_string()),
            stream_end_id: String::new(),
            stream_start_time: file_time(session.started_at),
            stream_end_time: String::new(),
            last_title: session.last_known_title.clone(),
            session_id: session.key().to_string(),
            saved_at: stamp.clone(),
            last_updated: stamp,
            update_count: 0,
            timeline_comments: Vec::new(),
            statistics: HighlightStatistics::default(),
        }
    }

    pub fn is_finished(&self) -> bool {
        !self.stream_end_time.is_empty()
    }
}

/// マージ結果
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub path: PathBuf,
    pub added: usize,
    pub total: usize,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// スコア差の統計を計算する
pub fn compute_statistics(comments: &[HighlightComment]) -> HighlightStatistics {
    let scores: Vec<f64> = comments
        .iter()
        .map(|c| c.score_difference)
        .filter(|s| *s > 0.0)
        .collect();

    let mut ranges = ScoreRanges::default();
    for score in &scores {
        ranges.add(*score);
    }

    let (avg, max, min) = if scores.is_empty() {
        (0.0, 0.0, 0.0)
    } else {
        let sum: f64 = scores.iter().sum();
        (
            sum / scores.len() as f64,
            scores.iter().copied().fold(f64::MIN, f64::max),
            scores.iter().copied().fold(f64::MAX, f64::min),
        )
    };

    HighlightStatistics {
        total_highlights: comments.len(),
        total_with_scores: scores.len(),
        avg_score: round2(avg),
        max_score: round2(max),
        min_score: round2(min),
        big_highlights: scores
            .iter()
            .filter(|s| **s > BIG_HIGHLIGHT_DIFFERENCE)
            .count(),
        score_ranges: ranges,
    }
}

/// ファイル名に使えない文字を置き換える
fn sanitize_file_component(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}

/// ファイル名末尾の開始時刻 `YYYY-MM-DD_HHMMSS`
fn start_stamp(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let chars: Vec<char> = stem.chars().collect();
    chars[chars.len().saturating_sub(17)..].iter().collect()
}

/// ハイライトファイルの保存先
#[derive(Debug, Clone)]
pub struct HighlightStore {
    dir: PathBuf,
}

impl HighlightStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `highlight_chat_{channel_name}_{channel_id}_{YYYY-MM-DD_HHMMSS}.json`
    ///
    /// 配信キー `(channel_id, started_at)` ごとに1ファイル。
    pub fn file_path(&self, session: &StreamSession) -> PathBuf {
        self.dir.join(format!(
            "highlight_chat_{}_{}_{}.json",
            sanitize_file_component(&session.channel_name),
            sanitize_file_component(session.channel_id.as_str()),
            session.started_at.format("%Y-%m-%d_%H%M%S")
        ))
    }

    pub fn load(path: &Path) -> HighliveResult<Option<HighlightFile>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        let file = serde_json::from_str(&content)?;
        Ok(Some(file))
    }

    /// 既存ファイルへマージして保存する
    pub fn merge_and_save(
        &self,
        session: &StreamSession,
        comments: Vec<HighlightComment>,
    ) -> HighliveResult<MergeOutcome> {
        fs::create_dir_all(&self.dir)?;
        let path = self.file_path(session);
        let now = Utc::now();

        let mut file = match Self::load(&path)? {
            Some(existing) => existing,
            None => HighlightFile::new(session, now),
        };

        let mut seen: HashSet<(String, String)> = file
            .timeline_comments
            .iter()
            .map(HighlightComment::merge_key)
            .collect();
        let mut added = 0;
        for comment in comments {
            if seen.insert(comment.merge_key()) {
                file.timeline_comments.push(comment);
                added += 1;
            }
        }
        file.timeline_comments.sort_by(|a, b| {
            a.comment_after_open_date
                .cmp(&b.comment_after_open_date)
                .then_with(|| a.vod_seconds.cmp(&b.vod_seconds))
        });

        if !session.last_known_title.is_empty() {
            file.last_title = session.last_known_title.clone();
        }
        if let Some(ended_at) = session.ended_at {
            file.stream_end_time = file_time(ended_at);
            file.stream_end_id = session
                .end_id
                .clone()
                .unwrap_or_else(|| ended_at.timestamp().to_string());
        }
        file.update_count += 1;
        file.last_updated = saved_stamp(now);
        file.statistics = compute_statistics(&file.timeline_comments);

        Self::write_atomic(&path, &file)?;

        info!(
            "💾 [HIGHLIGHT] saved {} (+{} / total {})",
            path.display(),
            added,
            file.timeline_comments.len()
        );
        Ok(MergeOutcome {
            path,
            added,
            total: file.timeline_comments.len(),
        })
    }

    /// 一時ファイルに書いてから置き換える
    fn write_atomic(path: &Path, file: &HighlightFile) -> HighliveResult<()> {
        let content = serde_json::to_string_pretty(file)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// チャンネルのハイライトファイルを新しい順に列挙する
    pub fn list_highlight_files(&self, channel_id: &ChannelId) -> HighliveResult<Vec<PathBuf>> {
        let pattern = self.dir.join(format!(
            "highlight_chat_*_{}_????-??-??_??????.json",
            glob::Pattern::escape(&sanitize_file_component(channel_id.as_str()))
        ));
        let pattern = pattern.to_string_lossy().to_string();

        let entries = glob::glob(&pattern)
            .map_err(|e| HighliveError::generic("list_highlight_files", e.to_string()))?;
        let mut files: Vec<PathBuf> = entries.filter_map(Result::ok).collect();
        files.sort_by_key(|path| std::cmp::Reverse(start_stamp(path)));
        debug!("[HIGHLIGHT] {} files for {}", files.len(), channel_id);
        Ok(files)
    }
}

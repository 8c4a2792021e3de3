//! ウィンドウ分析エンジン
//!
//! 5秒ごとのティックで直近30秒のチャットを集計し、合成スコアを算出して
//! ハイライト候補を判定する。状態はチャンネルの分析タスクが単独で所有する。

use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use tracing::{debug, info};

use super::scoring;
use crate::config::AnalyzerConfig;
use crate::models::{
    AnalysisSnapshot, ChatEvent, Highlight, ScoreDetails, StreamSession, Subscores, TagCounts,
};

/// 1ティック分の集計値（判定前）
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredTick {
    pub timestamp: DateTime<Utc>,
    pub window_message_count: usize,
    pub viewer_count: u64,
    pub tag_counts: TagCounts,
    pub subscores: Subscores,
    pub fun_score: f64,
    /// "ニックネーム: 本文" 形式の直近チャット
    pub context_sample: Vec<String>,
}

impl ScoredTick {
    /// スコアのみを持つティック
    pub fn from_score(timestamp: DateTime<Utc>, fun_score: f64) -> Self {
        Self {
            timestamp,
            window_message_count: 0,
            viewer_count: 0,
            tag_counts: TagCounts::default(),
            subscores: Subscores::default(),
            fun_score,
            context_sample: Vec::new(),
        }
    }
}

/// ティック処理中に起きたハイライトの変化
#[derive(Debug, Clone, PartialEq)]
pub enum HighlightChange {
    /// 新しいハイライトを開いた
    Opened(Highlight),
    /// より高いピークで置き換えた
    PeakRevised {
        previous_peak: f64,
        previous_was_big: bool,
        highlight: Highlight,
    },
    /// 同じバーストとして継続時間を延長した
    Merged(Highlight),
}

impl HighlightChange {
    /// 外部へ即時通知するハイライト
    ///
    /// 大型ハイライトが開いたとき、またはピークの置き換えで初めて大型になったときだけ返す。
    pub fn big_announcement(&self) -> Option<&Highlight> {
        match self {
            HighlightChange::Opened(highlight) if highlight.is_big => Some(highlight),
            HighlightChange::PeakRevised {
                previous_was_big: false,
                highlight,
                ..
            } if highlight.is_big => Some(highlight),
            _ => None,
        }
    }
}

/// ティックの処理結果
#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    pub snapshot: AnalysisSnapshot,
    pub change: Option<HighlightChange>,
    /// 保留上限を超えたため先行フラッシュする古いハイライト
    pub overflow: Vec<Highlight>,
}

/// 開いているバースト
#[derive(Debug, Clone)]
struct OpenBurst {
    started_at: DateTime<Utc>,
    peak_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct ActiveStream {
    session_id: String,
    started_at: DateTime<Utc>,
}

pub struct WindowedAnalyzer {
    config: AnalyzerConfig,
    chats: VecDeque<ChatEvent>,
    history: VecDeque<AnalysisSnapshot>,
    pending: Vec<Highlight>,
    burst: Option<OpenBurst>,
    /// 最後にピークが確定した時刻（クールダウンの基準）
    last_peak_at: Option<DateTime<Utc>>,
    stream: Option<ActiveStream>,
}

impl WindowedAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self {
            config,
            chats: VecDeque::new(),
            history: VecDeque::new(),
            pending: Vec::new(),
            burst: None,
            last_peak_at: None,
            stream: None,
        }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// 配信開始。前の配信の状態は破棄する
    pub fn begin_stream(&mut self, session: &StreamSession) {
        self.reset();
        self.stream = Some(ActiveStream {
            session_id: session.key().to_string(),
            started_at: session.started_at,
        });
    }

    pub fn has_stream(&self) -> bool {
        self.stream.is_some()
    }

    /// 配信終了。保留ハイライトと履歴を取り出して状態を初期化する
    pub fn end_stream(&mut self) -> (Vec<Highlight>, Vec<AnalysisSnapshot>) {
        let pending = std::mem::take(&mut self.pending);
        let history = self.history.drain(..).collect();
        self.reset();
        (pending, history)
    }

    fn reset(&mut self) {
        self.chats.clear();
        self.history.clear();
        self.pending.clear();
        self.burst = None;
        self.last_peak_at = None;
        self.stream = None;
    }

    /// チャットを取り込む
    pub fn ingest(&mut self, event: ChatEvent) {
        self.chats.push_back(event);
    }

    pub fn history(&self) -> &VecDeque<AnalysisSnapshot> {
        &self.history
    }

    pub fn pending(&self) -> &[Highlight] {
        &self.pending
    }

    /// 1ティック分の処理
    pub fn tick(&mut self, now: DateTime<Utc>, viewer_count: u64) -> TickOutcome {
        let scored = self.score_window(now, viewer_count);
        self.apply(scored)
    }

    /// ウィンドウ内のチャットからスコアを計算する
    pub fn score_window(&mut self, now: DateTime<Utc>, viewer_count: u64) -> ScoredTick {
        let retention = Duration::minutes(self.config.chat_retention_minutes);
        while let Some(front) = self.chats.front() {
            if front.occurred_at < now - retention {
                self.chats.pop_front();
            } else {
                break;
            }
        }

        let window_start = now - Duration::seconds(self.config.window_secs);
        let mut window: Vec<&ChatEvent> = self
            .chats
            .iter()
            .filter(|e| e.kind.is_chat() && e.occurred_at > window_start && e.occurred_at <= now)
            .collect();
        window.sort_by_key(|e| e.occurred_at);

        let mut tag_counts = TagCounts::default();
        for event in &window {
            for tag in &event.extracted_tags {
                tag_counts.add(*tag);
            }
        }
        let greeting_only = window.iter().filter(|e| e.is_greeting_only()).count();
        let effective = window.len() - greeting_only;

        let baseline = self.message_baseline().unwrap_or(window.len() as f64);
        let subscores = Subscores {
            chat_spike: scoring::chat_spike(effective, baseline),
            reaction: scoring::reaction(&tag_counts, baseline),
            diversity: scoring::diversity(&window),
            viewer_trend: scoring::viewer_trend(&self.history, now, viewer_count),
        };
        let fun_score = scoring::composite(&subscores);

        let sample_size = self.config.context_sample_size;
        let context_sample = window
            .iter()
            .skip(window.len().saturating_sub(sample_size))
            .map(|e| format!("{}: {}", e.nickname, e.text))
            .collect();

        ScoredTick {
            timestamp: now,
            window_message_count: window.len(),
            viewer_count,
            tag_counts,
            subscores,
            fun_score,
            context_sample,
        }
    }

    /// 直近ティックのメッセージ数の指数平滑平均
    fn message_baseline(&self) -> Option<f64> {
        let skip = self.history.len().saturating_sub(self.config.baseline_ticks);
        scoring::ema(
            self.history
                .iter()
                .skip(skip)
                .map(|s| s.window_message_count as f64),
            self.config.ema_alpha,
        )
    }

    /// 直近ティックのスコアから求める適応しきい値
    fn score_threshold(&self) -> f64 {
        let skip = self.history.len().saturating_sub(self.config.baseline_ticks);
        scoring::ema(
            self.history.iter().skip(skip).map(|s| s.fun_score),
            self.config.ema_alpha,
        )
        .unwrap_or(0.0)
    }

    /// 直近1分の最小スコア
    fn recent_min_score(&self, now: DateTime<Utc>) -> Option<f64> {
        let since = now - Duration::minutes(1);
        self.history
            .iter()
            .filter(|s| s.timestamp >= since)
            .map(|s| s.fun_score)
            .reduce(f64::min)
    }

    fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.last_peak_at
            .is_some_and(|at| now - at < Duration::seconds(self.config.cooldown_secs))
    }

    /// 集計済みティックを判定し、履歴に追加する
    pub fn apply(&mut self, tick: ScoredTick) -> TickOutcome {
        let now = tick.timestamp;
        let score = tick.fun_score;

        let delta = self
            .recent_min_score(now)
            .map(|min| score - min)
            .unwrap_or(0.0);
        let is_candidate = self.history.len() >= 2
            && score > self.score_threshold()
            && delta >= self.config.small_delta;
        let is_big = is_candidate && delta >= self.config.big_delta;

        let mut snapshot = AnalysisSnapshot {
            timestamp: now,
            window_message_count: tick.window_message_count,
            viewer_count: tick.viewer_count,
            tag_counts: tick.tag_counts,
            subscores: tick.subscores,
            fun_score: score,
            is_highlight_candidate: is_candidate,
            is_big_highlight: is_big,
            score_delta_from_recent_min: delta,
            opens_new_highlight: false,
        };

        let mut change = None;
        let mut overflow = Vec::new();

        if is_candidate && self.stream.is_some() {
            if !self.in_cooldown(now) {
                let highlight = self.build_highlight(&tick, delta, is_big, self.config.window_secs);
                snapshot.opens_new_highlight = true;
                self.burst = Some(OpenBurst {
                    started_at: now,
                    peak_at: now,
                });
                self.last_peak_at = Some(now);
                self.pending.push(highlight.clone());
                overflow = self.take_overflow();

                info!(
                    "✨ [ANALYZER] highlight opened score={:.1} delta={:.1} big={}",
                    score, delta, is_big
                );
                change = Some(HighlightChange::Opened(highlight));
            } else {
                change = self.revise_peak(&tick, &mut snapshot, delta, is_big);
            }
        } else if is_candidate {
            debug!("[ANALYZER] candidate without active stream score={:.1}", score);
        }

        self.push_history(snapshot.clone());

        TickOutcome {
            snapshot,
            change,
            overflow,
        }
    }

    /// クールダウン中の候補ティックを開いているバーストへ反映する
    ///
    /// 直前の開始ティックまで遡り、より高いスコアならピークを置き換える。
    /// 低いスコアでも非ハイライトティックの連続がしきい値未満なら同じバーストとして延長する。
    fn revise_peak(
        &mut self,
        tick: &ScoredTick,
        snapshot: &mut AnalysisSnapshot,
        delta: f64,
        is_big: bool,
    ) -> Option<HighlightChange> {
        let now = tick.timestamp;
        let cooldown_start = now - Duration::seconds(self.config.cooldown_secs);

        let mut quiet_ticks = 0usize;
        let mut contiguous = true;
        let mut opener = None;
        for (index, past) in self.history.iter().enumerate().rev() {
            if past.timestamp < cooldown_start {
                break;
            }
            if past.opens_new_highlight {
                opener = Some(index);
                break;
            }
            if past.is_highlight_candidate {
                quiet_ticks = 0;
            } else {
                quiet_ticks += 1;
                if quiet_ticks >= self.config.quiet_tick_cutoff {
                    contiguous = false;
                }
            }
        }

        let opener = opener?;
        let burst = self.burst.clone()?;
        let previous_peak = self.history[opener].fun_score;

        if tick.fun_score > previous_peak {
            self.history[opener].opens_new_highlight = false;
            snapshot.opens_new_highlight = true;
            self.last_peak_at = Some(now);

            let duration = (now - burst.started_at).num_seconds() + self.config.window_secs;
            let revised = self.build_highlight(tick, delta, is_big, duration);
            let mut previous_was_big = false;
            if let Some(slot) = self.pending.last_mut() {
                previous_was_big = slot.is_big;
                *slot = revised.clone();
            }
            self.burst = Some(OpenBurst {
                started_at: burst.started_at,
                peak_at: now,
            });

            info!(
                "📈 [ANALYZER] highlight peak revised {:.1} -> {:.1}",
                previous_peak, tick.fun_score
            );
            return Some(HighlightChange::PeakRevised {
                previous_peak,
                previous_was_big,
                highlight: revised,
            });
        }

        if contiguous {
            let duration = (now - burst.started_at).num_seconds() + self.config.window_secs;
            let slot = self.pending.last_mut()?;
            slot.duration_sec = slot.duration_sec.max(duration);
            debug!(
                "[ANALYZER] burst extended peak_at={} duration={}s",
                burst.peak_at, slot.duration_sec
            );
            return Some(HighlightChange::Merged(slot.clone()));
        }

        None
    }

    fn build_highlight(
        &self,
        tick: &ScoredTick,
        delta: f64,
        is_big: bool,
        duration_sec: i64,
    ) -> Highlight {
        let (session_id, vod_relative_timestamp) = match &self.stream {
            Some(stream) => (
                stream.session_id.clone(),
                (tick.timestamp - stream.started_at).num_seconds().max(0),
            ),
            None => (String::new(), 0),
        };

        Highlight {
            session_id,
            opened_at: tick.timestamp,
            peak_score: tick.fun_score,
            reason: describe_reason(&tick.tag_counts, &tick.subscores, tick.fun_score),
            chat_context_sample: tick.context_sample.clone(),
            duration_sec,
            vod_relative_timestamp,
            is_big,
            score_details: ScoreDetails {
                subscores: tick.subscores,
                tag_counts: tick.tag_counts,
                score_delta: delta,
                window_message_count: tick.window_message_count,
                viewer_count: tick.viewer_count,
            },
        }
    }

    /// 保留上限を超えた古いハイライトを取り出す
    fn take_overflow(&mut self) -> Vec<Highlight> {
        let limit = self.config.pending_limit.max(1);
        if self.pending.len() <= limit {
            return Vec::new();
        }
        let excess = self.pending.len() - limit;
        debug!("[ANALYZER] flushing {} pending highlights early", excess);
        self.pending.drain(..excess).collect()
    }

    fn push_history(&mut self, snapshot: AnalysisSnapshot) {
        self.history.push_back(snapshot);
        let horizon = Duration::minutes(self.config.history_minutes);
        while let (Some(front), Some(back)) = (self.history.front(), self.history.back()) {
            if back.timestamp - front.timestamp > horizon {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }
}

/// ピークティックのタグ数とスコアから理由文を組み立てる
pub fn describe_reason(tags: &TagCounts, subscores: &Subscores, score: f64) -> String {
    let mut reasons = Vec::new();
    if tags.laugh >= 10 {
        reasons.push("big laugh");
    }
    if tags.excitement >= 8 {
        reasons.push("excitement");
    }
    if tags.surprise >= 5 {
        reasons.push("surprise");
    }
    if subscores.chat_spike >= 80.0 {
        reasons.push("chat surge");
    }
    if score >= 80.0 {
        reasons.push("legendary moment");
    }

    if reasons.is_empty() {
        "lively chat".to_string()
    } else {
        reasons.join(" + ")
    }
}

//! サブスコア計算
//!
//! どのサブスコアも適応ベースラインとの比をシグモイドで0〜100に正規化する。

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashSet, VecDeque};

use crate::models::{AnalysisSnapshot, ChatEvent, Subscores, TagCounts};

/// 合成スコアの重み
pub const WEIGHT_CHAT_SPIKE: f64 = 0.35;
pub const WEIGHT_REACTION: f64 = 0.40;
pub const WEIGHT_DIVERSITY: f64 = 0.10;
pub const WEIGHT_VIEWER_TREND: f64 = 0.15;

/// タグごとの反応の重み
const LAUGH_WEIGHT: f64 = 4.0;
const EXCITEMENT_WEIGHT: f64 = 3.5;
const SURPRISE_WEIGHT: f64 = 2.5;
const OTHER_REACTION_WEIGHT: f64 = 1.0;

const CHAT_SPIKE_MIDPOINT: f64 = 1.5;
const CHAT_SPIKE_STEEPNESS: f64 = 2.0;
/// 平均メッセージ数あたり重み付きヒット2件で中央値
const REACTION_MIDPOINT: f64 = 2.0;
const REACTION_STEEPNESS: f64 = 1.5;

/// 視聴者トレンドの計算に必要な履歴の長さ
pub const VIEWER_TREND_MIN_HISTORY_MINUTES: i64 = 20;

/// 0〜100のロジスティック変換
pub fn sigmoid_score(x: f64, midpoint: f64, steepness: f64) -> f64 {
    100.0 / (1.0 + (-steepness * (x - midpoint)).exp())
}

/// 指数平滑平均。古い値から順に与える
pub fn ema(values: impl IntoIterator<Item = f64>, alpha: f64) -> Option<f64> {
    values.into_iter().fold(None, |acc, value| {
        Some(match acc {
            None => value,
            Some(prev) => alpha * value + (1.0 - alpha) * prev,
        })
    })
}

/// 標本標準偏差。2件未満は0
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

/// メッセージ数の急増度
pub fn chat_spike(effective_count: usize, baseline: f64) -> f64 {
    let ratio = effective_count as f64 / baseline.max(1.0);
    sigmoid_score(ratio, CHAT_SPIKE_MIDPOINT, CHAT_SPIKE_STEEPNESS)
}

/// 反応タグの重み付きヒット数
pub fn weighted_reaction_hits(tags: &TagCounts) -> f64 {
    tags.laugh as f64 * LAUGH_WEIGHT
        + tags.excitement as f64 * EXCITEMENT_WEIGHT
        + tags.surprise as f64 * SURPRISE_WEIGHT
        + tags.reaction as f64 * OTHER_REACTION_WEIGHT
}

pub fn reaction(tags: &TagCounts, baseline: f64) -> f64 {
    let ratio = weighted_reaction_hits(tags) / baseline.max(1.0);
    sigmoid_score(ratio, REACTION_MIDPOINT, REACTION_STEEPNESS)
}

/// 参加者の多様性
///
/// ユニーク投稿者率(最大40) + 文字数のばらつき(最大30) + 投稿間隔のばらつき(最大30)
pub fn diversity(window: &[&ChatEvent]) -> f64 {
    if window.is_empty() {
        return 0.0;
    }

    let unique_authors: HashSet<&str> = window.iter().map(|e| e.author.as_str()).collect();
    let unique_part = (unique_authors.len() as f64 / window.len() as f64 * 40.0).min(40.0);

    let lengths: Vec<f64> = window
        .iter()
        .map(|e| e.text.chars().count() as f64)
        .collect();
    let length_part = (std_dev(&lengths) / 20.0 * 30.0).min(30.0);

    let gaps: Vec<f64> = window
        .windows(2)
        .map(|pair| {
            (pair[1].occurred_at - pair[0].occurred_at).num_milliseconds() as f64 / 1000.0
        })
        .collect();
    let gap_part = (std_dev(&gaps) / 5.0 * 30.0).min(30.0);

    unique_part + length_part + gap_part
}

fn average_viewers(
    history: &VecDeque<AnalysisSnapshot>,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Option<f64> {
    let (sum, count) = history
        .iter()
        .filter(|s| s.timestamp >= from && s.timestamp < to)
        .fold((0u64, 0u32), |(sum, count), s| (sum + s.viewer_count, count + 1));
    (count > 0).then(|| sum as f64 / count as f64)
}

/// 視聴者数の伸び。20分以上の履歴がなければ0
pub fn viewer_trend(history: &VecDeque<AnalysisSnapshot>, now: DateTime<Utc>, current: u64) -> f64 {
    let span = Duration::minutes(VIEWER_TREND_MIN_HISTORY_MINUTES);
    match history.front() {
        Some(first) if first.timestamp <= now - span => {}
        _ => return 0.0,
    }

    let mut score: f64 = 0.0;

    // 直近10分と、その前の10分の比較
    let ten = Duration::minutes(10);
    let recent = average_viewers(history, now - ten, now);
    let previous = average_viewers(history, now - span, now - ten);
    if let (Some(recent), Some(previous)) = (recent, previous) {
        if previous > 0.0 {
            let growth = recent / previous;
            score += match growth {
                g if g >= 1.3 => 40.0,
                g if g >= 1.2 => 30.0,
                g if g >= 1.1 => 20.0,
                g if g >= 1.05 => 10.0,
                _ => 0.0,
            };
        }
    }

    // 直近1分平均に対する現在値の急増
    if let Some(minute_avg) = average_viewers(history, now - Duration::minutes(1), now) {
        if minute_avg > 0.0 {
            let spike = current as f64 / minute_avg;
            score += match spike {
                s if s >= 1.5 => 30.0,
                s if s >= 1.3 => 20.0,
                s if s >= 1.1 => 10.0,
                _ => 0.0,
            };
        }
    }

    // 20分を5区間に分けて単調増加ならボーナス
    let step = span / 5;
    let averages: Vec<Option<f64>> = (0..5)
        .map(|i| {
            let from = now - span + step * i;
            average_viewers(history, from, from + step)
        })
        .collect();
    if averages.iter().all(Option::is_some) {
        let values: Vec<f64> = averages.into_iter().flatten().collect();
        if values.windows(2).all(|pair| pair[1] > pair[0]) {
            score += 30.0;
        }
    }

    score.min(100.0)
}

/// 重み付き合成スコア（上限100）
pub fn composite(subscores: &Subscores) -> f64 {
    (subscores.chat_spike * WEIGHT_CHAT_SPIKE
        + subscores.reaction * WEIGHT_REACTION
        + subscores.diversity * WEIGHT_DIVERSITY
        + subscores.viewer_trend * WEIGHT_VIEWER_TREND)
        .min(100.0)
}

//! ウィンドウ分析
//!
//! - `scoring`: サブスコアと合成スコア
//! - `engine`: ティックごとの判定（ヒステリシス、クールダウン、ピーク修正）
//! - `task`: チャンネルごとの非同期タスク

pub mod engine;
pub mod scoring;
pub mod task;

pub use engine::{describe_reason, HighlightChange, ScoredTick, TickOutcome, WindowedAnalyzer};
pub use task::{AnalyzerCommand, AnalyzerTask};

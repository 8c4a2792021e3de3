//! 受信フレームのマイクロバッチ

use std::time::Duration;
use tokio::time::Instant;

/// 件数または経過時間のどちらかでフラッシュするバッファ
#[derive(Debug)]
pub struct FrameBuffer<T> {
    items: Vec<T>,
    batch_size: usize,
    flush_timeout: Duration,
    last_flush: Instant,
}

impl<T> FrameBuffer<T> {
    pub fn new(batch_size: usize, flush_timeout: Duration, now: Instant) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            items: Vec::with_capacity(batch_size),
            batch_size,
            flush_timeout,
            last_flush: now,
        }
    }

    /// 追加し、フラッシュ条件を満たせばバッチを返す
    pub fn push(&mut self, item: T, now: Instant) -> Option<Vec<T>> {
        self.items.push(item);
        if self.items.len() >= self.batch_size || self.is_stale(now) {
            return self.take(now);
        }
        None
    }

    /// アイドル時のチェック。保持期間を過ぎていれば保持分を返す
    pub fn poll_stale(&mut self, now: Instant) -> Option<Vec<T>> {
        if self.items.is_empty() || !self.is_stale(now) {
            return None;
        }
        self.take(now)
    }

    /// 次にフラッシュすべきまでの残り時間。空ならNone
    pub fn time_until_flush(&self, now: Instant) -> Option<Duration> {
        if self.items.is_empty() {
            return None;
        }
        Some((self.last_flush + self.flush_timeout).saturating_duration_since(now))
    }

    /// 条件に関係なく全て取り出す
    pub fn drain(&mut self, now: Instant) -> Option<Vec<T>> {
        self.take(now)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn is_stale(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_flush) >= self.flush_timeout
    }

    fn take(&mut self, now: Instant) -> Option<Vec<T>> {
        self.last_flush = now;
        if self.items.is_empty() {
            return None;
        }
        Some(std::mem::replace(
            &mut self.items,
            Vec::with_capacity(self.batch_size),
        ))
    }
}

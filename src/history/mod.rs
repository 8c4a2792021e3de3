//! 分析履歴の永続化（SQLite）
//!
//! 配信終了時に分析エンジンの履歴をまとめて書き出す。14日より古い配信は
//! スナップショットごと削除される。

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

use crate::error::HighliveResult;
use crate::models::{AnalysisSnapshot, StreamSession, StreamSessionKey};

pub struct HistoryStore {
    connection: Mutex<Connection>,
}

impl HistoryStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> HighliveResult<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let connection = Connection::open(db_path)?;
        Self::initialize(connection)
    }

    /// インメモリデータベース（テスト用）
    pub fn open_in_memory() -> HighliveResult<Self> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(connection: Connection) -> HighliveResult<Self> {
        connection.execute_batch("PRAGMA foreign_keys = ON;")?;
        connection.execute_batch(include_str!("schema.sql"))?;
        tracing::debug!("[HISTORY] schema initialized");
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    /// 配信開始を記録（重複は無視）
    pub fn record_session_start(&self, session: &StreamSession) -> HighliveResult<()> {
        let conn = self.connection.lock();
        conn.execute(
            "INSERT OR IGNORE INTO stream_sessions
             (id, channel_id, channel_name, started_at, title, start_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session.key().to_string(),
                session.channel_id.as_str(),
                session.channel_name,
                session.started_at,
                session.last_known_title,
                session.start_id,
            ],
        )?;
        Ok(())
    }

    /// 配信終了を記録
    pub fn record_session_end(&self, session: &StreamSession) -> HighliveResult<()> {
        let conn = self.connection.lock();
        conn.execute(
            "UPDATE stream_sessions SET ended_at = ?1, end_id = ?2, title = ?3 WHERE id = ?4",
            params![
                session.ended_at,
                session.end_id,
                session.last_known_title,
                session.key().to_string(),
            ],
        )?;
        Ok(())
    }

    /// スナップショットを一括保存する。同じ時刻のものは上書き
    pub fn save_snapshots(
        &self,
        key: &StreamSessionKey,
        snapshots: &[AnalysisSnapshot],
    ) -> HighliveResult<usize> {
        let mut conn = self.connection.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO analysis_snapshots
                 (session_id, timestamp, window_message_count, viewer_count, fun_score,
                  is_highlight_candidate, is_big_highlight, score_delta, opens_new_highlight,
                  tag_counts, subscores)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            let session_id = key.to_string();
            for snapshot in snapshots {
                stmt.execute(params![
                    session_id,
                    snapshot.timestamp,
                    snapshot.window_message_count as i64,
                    snapshot.viewer_count as i64,
                    snapshot.fun_score,
                    snapshot.is_highlight_candidate,
                    snapshot.is_big_highlight,
                    snapshot.score_delta_from_recent_min,
                    snapshot.opens_new_highlight,
                    serde_json::to_string(&snapshot.tag_counts)?,
                    serde_json::to_string(&snapshot.subscores)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(snapshots.len())
    }

    pub fn load_snapshots(&self, key: &StreamSessionKey) -> HighliveResult<Vec<AnalysisSnapshot>> {
        let conn = self.connection.lock();
        let mut stmt = conn.prepare(
            "SELECT timestamp, window_message_count, viewer_count, fun_score,
                    is_highlight_candidate, is_big_highlight, score_delta, opens_new_highlight,
                    tag_counts, subscores
             FROM analysis_snapshots WHERE session_id = ?1 ORDER BY timestamp",
        )?;
        let rows = stmt.query_map(params![key.to_string()], Self::snapshot_from_row)?;

        let mut snapshots = Vec::new();
        for row in rows {
            let (mut snapshot, tags, subscores) = row?;
            snapshot.tag_counts = serde_json::from_str(&tags)?;
            snapshot.subscores = serde_json::from_str(&subscores)?;
            snapshots.push(snapshot);
        }
        Ok(snapshots)
    }

    fn snapshot_from_row(row: &Row) -> rusqlite::Result<(AnalysisSnapshot, String, String)> {
        let snapshot = AnalysisSnapshot {
            timestamp: row.get(0)?,
            window_message_count: row.get::<_, i64>(1)? as usize,
            viewer_count: row.get::<_, i64>(2)? as u64,
            fun_score: row.get(3)?,
            is_highlight_candidate: row.get(4)?,
            is_big_highlight: row.get(5)?,
            score_delta_from_recent_min: row.get(6)?,
            opens_new_highlight: row.get(7)?,
            tag_counts: Default::default(),
            subscores: Default::default(),
        };
        Ok((snapshot, row.get(8)?, row.get(9)?))
    }

    /// 配信終了時刻（未終了ならNone）
    pub fn session_ended_at(&self, key: &StreamSessionKey) -> HighliveResult<Option<DateTime<Utc>>> {
        let conn = self.connection.lock();
        let ended_at = conn
            .query_row(
                "SELECT ended_at FROM stream_sessions WHERE id = ?1",
                params![key.to_string()],
                |row| row.get::<_, Option<DateTime<Utc>>>(0),
            )
            .optional()?;
        Ok(ended_at.flatten())
    }

    /// 指定時刻より前に始まった配信を削除する
    pub fn prune_sessions_before(&self, cutoff: DateTime<Utc>) -> HighliveResult<usize> {
        let conn = self.connection.lock();
        let removed = conn.execute(
            "DELETE FROM stream_sessions WHERE started_at < ?1",
            params![cutoff],
        )?;
        if removed > 0 {
            tracing::info!("🧹 [HISTORY] pruned {} old sessions", removed);
        }
        Ok(removed)
    }

    pub fn session_count(&self) -> HighliveResult<usize> {
        let conn = self.connection.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM stream_sessions", [], |row| {
            row.get(0)
        })?;
        Ok(count as usize)
    }
}

use super::core::ActionLogRepository;
use crate::domain::action_log::ActionLog;
use crate::repository::error::RepositoryResult;
use crate::repository::schema::datetime_at;
use rusqlite::{params, Result as SqliteResult, Row};

const SELECT_COLUMNS: &str = r#"
    SELECT action_id, action_type, action_ts, actor,
           transfer_id, channel_id,
           payload_json, impact_summary_json, detail
    FROM action_log
"#;

impl ActionLogRepository {
    // ==========================================
    // 查询操作
    // ==========================================

    /// 按 action_id 查询单个日志
    pub fn find_by_id(&self, action_id: &str) -> RepositoryResult<Option<ActionLog>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!("{} WHERE action_id = ?", SELECT_COLUMNS))?;

        match stmt.query_row(params![action_id], map_row) {
            Ok(log) => Ok(Some(log)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// 查询调拨单的操作历史 (按时间倒序)
    pub fn find_by_transfer(&self, transfer_id: &str) -> RepositoryResult<Vec<ActionLog>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE transfer_id = ? ORDER BY action_ts DESC, rowid DESC",
            SELECT_COLUMNS
        ))?;

        let logs = stmt
            .query_map(params![transfer_id], map_row)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(logs)
    }

    /// 查询通道的操作历史
    pub fn find_by_channel(&self, channel_id: &str) -> RepositoryResult<Vec<ActionLog>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE channel_id = ? ORDER BY action_ts DESC, rowid DESC",
            SELECT_COLUMNS
        ))?;

        let logs = stmt
            .query_map(params![channel_id], map_row)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(logs)
    }

    /// 最近 N 条日志
    pub fn find_recent(&self, limit: i64) -> RepositoryResult<Vec<ActionLog>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} ORDER BY action_ts DESC, rowid DESC LIMIT ?",
            SELECT_COLUMNS
        ))?;

        let logs = stmt
            .query_map(params![limit], map_row)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(logs)
    }
}

fn map_row(row: &Row<'_>) -> SqliteResult<ActionLog> {
    let payload: Option<String> = row.get(6)?;
    let impact: Option<String> = row.get(7)?;
    Ok(ActionLog {
        action_id: row.get(0)?,
        action_type: row.get(1)?,
        action_ts: datetime_at(row, 2)?,
        actor: row.get(3)?,
        transfer_id: row.get(4)?,
        channel_id: row.get(5)?,
        // 损坏的 JSON 不应让整条审计记录不可读
        payload_json: payload.and_then(|s| serde_json::from_str(&s).ok()),
        impact_summary_json: impact.and_then(|s| serde_json::from_str(&s).ok()),
        detail: row.get(8)?,
    })
}

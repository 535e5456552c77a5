// ==========================================
// 仓库出库释放系统 - 释放通道数据仓储
// ==========================================
// 列表型条件 (伙伴/承运商/星期/地理区域) 以 JSON 文本存储
// ==========================================

use crate::domain::channel::{GeoZone, ReleaseChannel};
use crate::domain::types::{BatchMode, ChannelState};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::schema::{datetime_at, fmt_datetime, fmt_opt_date, opt_date_at};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex};

const SELECT_COLUMNS: &str = r#"
    SELECT channel_id, name, sequence, state, batch_mode,
           partner_ids_json, carrier_ids_json, delivery_weekdays_json, geo_zone_json,
           warehouse_id, exclude_public_holidays, preparation_plan_id,
           last_wake_date, updated_at
    FROM release_channel
"#;

pub struct ChannelRepository {
    conn: Arc<Mutex<Connection>>,
}

impl ChannelRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    pub fn insert(&self, channel: &ReleaseChannel) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        Self::insert_with(&conn, channel)
    }

    pub fn insert_with(conn: &Connection, c: &ReleaseChannel) -> RepositoryResult<()> {
        conn.execute(
            r#"
            INSERT INTO release_channel (
                channel_id, name, sequence, state, batch_mode,
                partner_ids_json, carrier_ids_json, delivery_weekdays_json, geo_zone_json,
                warehouse_id, exclude_public_holidays, preparation_plan_id,
                last_wake_date, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
            params![
                c.channel_id,
                c.name,
                c.sequence,
                c.state.as_str(),
                c.batch_mode.as_str(),
                to_json(&c.partner_ids)?,
                to_json(&c.carrier_ids)?,
                to_json(&c.delivery_weekdays)?,
                c.geo_zone.as_ref().map(to_json).transpose()?,
                c.warehouse_id,
                c.exclude_public_holidays as i32,
                c.preparation_plan_id,
                fmt_opt_date(&c.last_wake_date),
                fmt_datetime(&c.updated_at),
            ],
        )?;
        Ok(())
    }

    /// 更新状态与唤醒日期 (状态机唯一写入口)
    pub fn update_state_with(conn: &Connection, c: &ReleaseChannel) -> RepositoryResult<()> {
        let affected = conn.execute(
            r#"
            UPDATE release_channel
            SET state = ?1, last_wake_date = ?2, updated_at = ?3
            WHERE channel_id = ?4
            "#,
            params![
                c.state.as_str(),
                fmt_opt_date(&c.last_wake_date),
                fmt_datetime(&c.updated_at),
                c.channel_id,
            ],
        )?;
        if affected == 0 {
            return Err(RepositoryError::NotFound {
                entity: "ReleaseChannel".to_string(),
                id: c.channel_id.clone(),
            });
        }
        Ok(())
    }

    pub fn find_by_id_with(conn: &Connection, channel_id: &str) -> RepositoryResult<Option<ReleaseChannel>> {
        let c = conn
            .query_row(
                &format!("{} WHERE channel_id = ?1", SELECT_COLUMNS),
                params![channel_id],
                map_row,
            )
            .optional()?;
        Ok(c)
    }

    pub fn find_by_id(&self, channel_id: &str) -> RepositoryResult<Option<ReleaseChannel>> {
        let conn = self.get_conn()?;
        Self::find_by_id_with(&conn, channel_id)
    }

    /// 全部通道,按序号升序
    pub fn list_all(&self) -> RepositoryResult<Vec<ReleaseChannel>> {
        let conn = self.get_conn()?;
        Self::list_all_with(&conn)
    }

    pub fn list_all_with(conn: &Connection) -> RepositoryResult<Vec<ReleaseChannel>> {
        let mut stmt = conn.prepare(&format!("{} ORDER BY sequence ASC, channel_id ASC", SELECT_COLUMNS))?;
        let list = stmt
            .query_map([], map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(list)
    }

    pub fn list_by_plan_with(conn: &Connection, plan_id: &str) -> RepositoryResult<Vec<ReleaseChannel>> {
        let mut stmt = conn.prepare(&format!(
            "{} WHERE preparation_plan_id = ?1 ORDER BY sequence ASC, channel_id ASC",
            SELECT_COLUMNS
        ))?;
        let list = stmt
            .query_map(params![plan_id], map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(list)
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> RepositoryResult<String> {
    serde_json::to_string(value).map_err(|e| RepositoryError::FieldValueError {
        field: "json".to_string(),
        message: e.to_string(),
    })
}

fn json_at<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<ReleaseChannel> {
    let state_raw: String = row.get(3)?;
    let state = ChannelState::parse(&state_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(3, Type::Text, format!("未知通道状态: {}", state_raw).into())
    })?;
    let mode_raw: String = row.get(4)?;
    let batch_mode = BatchMode::parse(&mode_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(4, Type::Text, format!("未知批处理模式: {}", mode_raw).into())
    })?;
    let geo_zone: Option<GeoZone> = match row.get::<_, Option<String>>(8)? {
        Some(raw) => Some(
            serde_json::from_str(&raw)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(e)))?,
        ),
        None => None,
    };

    Ok(ReleaseChannel {
        channel_id: row.get(0)?,
        name: row.get(1)?,
        sequence: row.get(2)?,
        state,
        batch_mode,
        partner_ids: json_at(row, 5)?,
        carrier_ids: json_at(row, 6)?,
        delivery_weekdays: json_at(row, 7)?,
        geo_zone,
        warehouse_id: row.get(9)?,
        exclude_public_holidays: row.get::<_, i32>(10)? != 0,
        preparation_plan_id: row.get(11)?,
        last_wake_date: opt_date_at(row, 12)?,
        updated_at: datetime_at(row, 13)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::schema::ensure_schema;
    use chrono::NaiveDate;

    #[test]
    fn test_round_trip_with_json_fields() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();
        let repo = ChannelRepository::new(Arc::new(Mutex::new(conn)));

        let channel = ReleaseChannel {
            channel_id: "C1".to_string(),
            name: "Paris morning".to_string(),
            sequence: 5,
            state: ChannelState::Open,
            batch_mode: BatchMode::Automatic,
            partner_ids: vec!["ACME".to_string()],
            carrier_ids: vec![],
            delivery_weekdays: vec![1, 3, 5],
            geo_zone: Some(GeoZone {
                polygon: vec![(48.0, 2.0), (49.0, 2.0), (49.0, 3.0)],
            }),
            warehouse_id: Some("WH1".to_string()),
            exclude_public_holidays: true,
            preparation_plan_id: None,
            last_wake_date: NaiveDate::from_ymd_opt(2026, 3, 2),
            updated_at: NaiveDate::from_ymd_opt(2026, 3, 2)
                .unwrap()
                .and_hms_opt(6, 0, 0)
                .unwrap(),
        };
        repo.insert(&channel).unwrap();

        let loaded = repo.find_by_id("C1").unwrap().unwrap();
        assert_eq!(loaded, channel);
        assert_eq!(repo.list_all().unwrap().len(), 1);
    }
}

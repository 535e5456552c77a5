// ==========================================
// 仓库出库释放系统 - 调拨单数据仓储
// ==========================================
// 调拨单的写入只在持有该单租约时进行,因此不再做乐观锁校验
// ==========================================

use crate::domain::transfer::Transfer;
use crate::domain::types::ShippingPolicy;
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::schema::{datetime_at, fmt_datetime, fmt_opt_datetime, opt_datetime_at};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex};

const SELECT_COLUMNS: &str = r#"
    SELECT transfer_id, name, partner_id, commercial_partner_id, carrier_id,
           warehouse_id, delivery_lat, delivery_lon, shipping_policy,
           scheduled_date, commitment_date, release_channel_id,
           last_release_date, confirmed_at, needs_release, is_closed, backorder_of
    FROM transfer
"#;

pub struct TransferRepository {
    conn: Arc<Mutex<Connection>>,
}

impl TransferRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    // ==========================================
    // 写入
    // ==========================================

    pub fn insert(&self, transfer: &Transfer) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        Self::insert_with(&conn, transfer)
    }

    pub fn insert_with(conn: &Connection, t: &Transfer) -> RepositoryResult<()> {
        conn.execute(
            r#"
            INSERT INTO transfer (
                transfer_id, name, partner_id, commercial_partner_id, carrier_id,
                warehouse_id, delivery_lat, delivery_lon, shipping_policy,
                scheduled_date, commitment_date, release_channel_id,
                last_release_date, confirmed_at, needs_release, is_closed, backorder_of
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            "#,
            params![
                t.transfer_id,
                t.name,
                t.partner_id,
                t.commercial_partner_id,
                t.carrier_id,
                t.warehouse_id,
                t.delivery_lat,
                t.delivery_lon,
                t.shipping_policy.as_str(),
                fmt_datetime(&t.scheduled_date),
                fmt_opt_datetime(&t.commitment_date),
                t.release_channel_id,
                fmt_opt_datetime(&t.last_release_date),
                fmt_datetime(&t.confirmed_at),
                t.needs_release as i32,
                t.is_closed as i32,
                t.backorder_of,
            ],
        )?;
        Ok(())
    }

    pub fn update_with(conn: &Connection, t: &Transfer) -> RepositoryResult<()> {
        let affected = conn.execute(
            r#"
            UPDATE transfer SET
                name = ?1, partner_id = ?2, commercial_partner_id = ?3, carrier_id = ?4,
                warehouse_id = ?5, delivery_lat = ?6, delivery_lon = ?7, shipping_policy = ?8,
                scheduled_date = ?9, commitment_date = ?10, release_channel_id = ?11,
                last_release_date = ?12, confirmed_at = ?13, needs_release = ?14,
                is_closed = ?15, backorder_of = ?16
            WHERE transfer_id = ?17
            "#,
            params![
                t.name,
                t.partner_id,
                t.commercial_partner_id,
                t.carrier_id,
                t.warehouse_id,
                t.delivery_lat,
                t.delivery_lon,
                t.shipping_policy.as_str(),
                fmt_datetime(&t.scheduled_date),
                fmt_opt_datetime(&t.commitment_date),
                t.release_channel_id,
                fmt_opt_datetime(&t.last_release_date),
                fmt_datetime(&t.confirmed_at),
                t.needs_release as i32,
                t.is_closed as i32,
                t.backorder_of,
                t.transfer_id,
            ],
        )?;
        if affected == 0 {
            return Err(RepositoryError::NotFound {
                entity: "Transfer".to_string(),
                id: t.transfer_id.clone(),
            });
        }
        Ok(())
    }

    pub fn update(&self, transfer: &Transfer) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        Self::update_with(&conn, transfer)
    }

    /// 休眠通道时解除其上待释放调拨单的分配
    pub fn unassign_pending_by_channel_with(
        conn: &Connection,
        channel_id: &str,
    ) -> RepositoryResult<Vec<String>> {
        let mut stmt = conn.prepare(
            r#"
            SELECT transfer_id FROM transfer
            WHERE release_channel_id = ?1 AND needs_release = 1 AND is_closed = 0
            ORDER BY transfer_id
            "#,
        )?;
        let ids = stmt
            .query_map(params![channel_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        conn.execute(
            r#"
            UPDATE transfer SET release_channel_id = NULL
            WHERE release_channel_id = ?1 AND needs_release = 1 AND is_closed = 0
            "#,
            params![channel_id],
        )?;
        Ok(ids)
    }

    // ==========================================
    // 查询
    // ==========================================

    pub fn find_by_id_with(conn: &Connection, transfer_id: &str) -> RepositoryResult<Option<Transfer>> {
        let t = conn
            .query_row(
                &format!("{} WHERE transfer_id = ?1", SELECT_COLUMNS),
                params![transfer_id],
                map_row,
            )
            .optional()?;
        Ok(t)
    }

    pub fn find_by_id(&self, transfer_id: &str) -> RepositoryResult<Option<Transfer>> {
        let conn = self.get_conn()?;
        Self::find_by_id_with(&conn, transfer_id)
    }

    pub fn find_by_ids(&self, transfer_ids: &[String]) -> RepositoryResult<Vec<Transfer>> {
        if transfer_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.get_conn()?;
        let placeholders = vec!["?"; transfer_ids.len()].join(", ");
        let mut stmt = conn.prepare(&format!(
            "{} WHERE transfer_id IN ({}) ORDER BY transfer_id",
            SELECT_COLUMNS, placeholders
        ))?;
        let list = stmt
            .query_map(params_from_iter(transfer_ids.iter()), map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(list)
    }

    /// 指定通道上需要释放的调拨单 (按计划日期先后)
    pub fn list_needing_release_by_channel(&self, channel_id: &str) -> RepositoryResult<Vec<Transfer>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"{} WHERE release_channel_id = ?1 AND needs_release = 1 AND is_closed = 0
               ORDER BY scheduled_date ASC, transfer_id ASC"#,
            SELECT_COLUMNS
        ))?;
        let list = stmt
            .query_map(params![channel_id], map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(list)
    }

    /// 尚未分配通道的待释放调拨单
    pub fn list_unassigned_needing_release(&self) -> RepositoryResult<Vec<Transfer>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"{} WHERE release_channel_id IS NULL AND needs_release = 1 AND is_closed = 0
               ORDER BY scheduled_date ASC, transfer_id ASC"#,
            SELECT_COLUMNS
        ))?;
        let list = stmt
            .query_map([], map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(list)
    }

    pub fn count_pending_by_channel_with(conn: &Connection, channel_id: &str) -> RepositoryResult<i64> {
        let count = conn.query_row(
            r#"
            SELECT COUNT(*) FROM transfer
            WHERE release_channel_id = ?1 AND needs_release = 1 AND is_closed = 0
            "#,
            params![channel_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<Transfer> {
    let policy_raw: String = row.get(8)?;
    let shipping_policy = ShippingPolicy::parse(&policy_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            8,
            rusqlite::types::Type::Text,
            format!("未知发货策略: {}", policy_raw).into(),
        )
    })?;

    Ok(Transfer {
        transfer_id: row.get(0)?,
        name: row.get(1)?,
        partner_id: row.get(2)?,
        commercial_partner_id: row.get(3)?,
        carrier_id: row.get(4)?,
        warehouse_id: row.get(5)?,
        delivery_lat: row.get(6)?,
        delivery_lon: row.get(7)?,
        shipping_policy,
        scheduled_date: datetime_at(row, 9)?,
        commitment_date: opt_datetime_at(row, 10)?,
        release_channel_id: row.get(11)?,
        last_release_date: opt_datetime_at(row, 12)?,
        confirmed_at: datetime_at(row, 13)?,
        needs_release: row.get::<_, i32>(14)? != 0,
        is_closed: row.get::<_, i32>(15)? != 0,
        backorder_of: row.get(16)?,
    })
}

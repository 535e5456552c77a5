// ==========================================
// 仓库出库释放系统 - 库存数量账本 (SQLite 适配器)
// ==========================================
// 职责: 按库位子树读取在库量与预计入库量
// 库位层级以物化路径表示: 根 "WH/", 子 "WH/STOCK/"
// 排除标记向下继承: 祖先被排除则子孙一并排除
// ==========================================

use crate::engine::availability::{LocationQuantity, QuantityLedger};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::schema::{decimal_at, fmt_datetime};
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

pub struct SqliteQuantityLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteQuantityLedger {
    /// 使用独立连接,避免与释放工作单元的连接互相等待
    pub fn new(db_path: &str) -> RepositoryResult<Self> {
        let conn = crate::db::open_sqlite_connection(db_path)?;
        Ok(Self::from_connection(Arc::new(Mutex::new(conn))))
    }

    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    // ==========================================
    // 主数据维护
    // ==========================================

    pub fn insert_location(
        &self,
        location_id: &str,
        parent_id: Option<&str>,
        excluded_from_usable: bool,
    ) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let parent_path: Option<String> = match parent_id {
            Some(pid) => Some(
                conn.query_row(
                    "SELECT path FROM location WHERE location_id = ?1",
                    params![pid],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| RepositoryError::NotFound {
                    entity: "Location".to_string(),
                    id: pid.to_string(),
                })?,
            ),
            None => None,
        };
        let path = format!("{}{}/", parent_path.unwrap_or_default(), location_id);

        conn.execute(
            r#"
            INSERT INTO location (location_id, parent_id, path, excluded_from_usable)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![location_id, parent_id, path, excluded_from_usable as i32],
        )?;
        Ok(())
    }

    /// 设置在库量 (覆盖)
    pub fn set_on_hand(&self, product_id: &str, location_id: &str, qty: Decimal) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO stock_quant (product_id, location_id, quantity) VALUES (?1, ?2, ?3)
            ON CONFLICT(product_id, location_id) DO UPDATE SET quantity = excluded.quantity
            "#,
            params![product_id, location_id, qty.to_string()],
        )?;
        Ok(())
    }

    pub fn add_incoming(
        &self,
        product_id: &str,
        location_id: &str,
        qty: Decimal,
        expected_date: NaiveDateTime,
    ) -> RepositoryResult<String> {
        let conn = self.get_conn()?;
        let incoming_id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            r#"
            INSERT INTO stock_incoming (incoming_id, product_id, location_id, quantity, expected_date)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![incoming_id, product_id, location_id, qty.to_string(), fmt_datetime(&expected_date)],
        )?;
        Ok(incoming_id)
    }
}

impl QuantityLedger for SqliteQuantityLedger {
    fn location_path(&self, location_id: &str) -> RepositoryResult<Option<String>> {
        let conn = self.get_conn()?;
        let path = conn
            .query_row(
                "SELECT path FROM location WHERE location_id = ?1",
                params![location_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(path)
    }

    fn location_quantities(
        &self,
        product_id: &str,
        location_subtree: &str,
        horizon: NaiveDateTime,
    ) -> RepositoryResult<Vec<LocationQuantity>> {
        let conn = self.get_conn()?;

        // 子树内全部库位及其 (继承的) 排除标记
        let mut stmt = conn.prepare(
            r#"
            SELECT l.location_id,
                   EXISTS (
                       SELECT 1 FROM location ex
                       WHERE ex.excluded_from_usable = 1
                         AND substr(l.path, 1, length(ex.path)) = ex.path
                   ) AS excluded
            FROM location l
            JOIN location root ON root.location_id = ?1
            WHERE substr(l.path, 1, length(root.path)) = root.path
            "#,
        )?;
        let mut by_location: BTreeMap<String, LocationQuantity> = stmt
            .query_map(params![location_subtree], |row| {
                let location_id: String = row.get(0)?;
                Ok((
                    location_id.clone(),
                    LocationQuantity {
                        location_id,
                        on_hand: Decimal::ZERO,
                        incoming: Decimal::ZERO,
                        excluded_from_usable: row.get::<_, i32>(1)? != 0,
                    },
                ))
            })?
            .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;

        if by_location.is_empty() {
            return Ok(Vec::new());
        }

        let mut stmt = conn.prepare(
            "SELECT location_id, quantity FROM stock_quant WHERE product_id = ?1",
        )?;
        let quants = stmt
            .query_map(params![product_id], |row| {
                Ok((row.get::<_, String>(0)?, decimal_at(row, 1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (location_id, qty) in quants {
            if let Some(entry) = by_location.get_mut(&location_id) {
                entry.on_hand += qty;
            }
        }

        let mut stmt = conn.prepare(
            r#"
            SELECT location_id, quantity FROM stock_incoming
            WHERE product_id = ?1 AND expected_date <= ?2
            "#,
        )?;
        let incoming = stmt
            .query_map(params![product_id, fmt_datetime(&horizon)], |row| {
                Ok((row.get::<_, String>(0)?, decimal_at(row, 1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (location_id, qty) in incoming {
            if let Some(entry) = by_location.get_mut(&location_id) {
                entry.incoming += qty;
            }
        }

        Ok(by_location.into_values().collect())
    }
}

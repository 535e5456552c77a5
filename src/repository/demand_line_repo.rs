// ==========================================
// 仓库出库释放系统 - 需求行数据仓储
// ==========================================
// 并发控制: revision 乐观锁,更新时校验并自增
// 事务内操作以 *_with(conn, ..) 形式提供,由调用方的检查点包裹
// ==========================================

use crate::domain::demand_line::DemandLine;
use crate::domain::types::LineState;
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::schema::{
    datetime_at, decimal_at, fmt_datetime, fmt_opt_datetime, opt_datetime_at,
};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex};

const SELECT_COLUMNS: &str = r#"
    SELECT line_id, transfer_id, group_id, product_id,
           source_location_id, dest_location_id, uom_rounding,
           requested_qty, reserved_qty, picked_qty,
           state, needs_release, release_blocked, released_at,
           route_id, no_backorder_at_release, carrier_id, service_level,
           requires_other_lines, priority, date_priority,
           is_backorder_of, revision
    FROM demand_line
"#;

/// 承诺顺序: 优先级降序, 日期优先级升序, 行ID升序
pub const PROMISE_ORDER: &str = "ORDER BY priority DESC, date_priority ASC, line_id ASC";

pub struct DemandLineRepository {
    conn: Arc<Mutex<Connection>>,
}

impl DemandLineRepository {
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

    pub fn insert(&self, line: &DemandLine) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        Self::insert_with(&conn, line)
    }

    pub fn insert_with(conn: &Connection, line: &DemandLine) -> RepositoryResult<()> {
        line.check_invariants()
            .map_err(RepositoryError::ValidationError)?;

        conn.execute(
            r#"
            INSERT INTO demand_line (
                line_id, transfer_id, group_id, product_id,
                source_location_id, dest_location_id, uom_rounding,
                requested_qty, reserved_qty, picked_qty,
                state, needs_release, release_blocked, released_at,
                route_id, no_backorder_at_release, carrier_id, service_level,
                requires_other_lines, priority, date_priority,
                is_backorder_of, revision
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                      ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)
            "#,
            params![
                line.line_id,
                line.transfer_id,
                line.group_id,
                line.product_id,
                line.source_location_id,
                line.dest_location_id,
                line.uom_rounding.to_string(),
                line.requested_qty.to_string(),
                line.reserved_qty.to_string(),
                line.picked_qty.to_string(),
                line.state.as_str(),
                line.needs_release as i32,
                line.release_blocked as i32,
                fmt_opt_datetime(&line.released_at),
                line.route_id,
                line.no_backorder_at_release as i32,
                line.carrier_id,
                line.service_level,
                line.requires_other_lines as i32,
                line.priority,
                fmt_datetime(&line.date_priority),
                line.is_backorder_of,
                line.revision,
            ],
        )?;
        Ok(())
    }

    /// 带乐观锁的整行更新
    ///
    /// 成功后 line.revision 自增; 行已被他人修改时返回 OptimisticLockFailure
    pub fn update_with(conn: &Connection, line: &mut DemandLine) -> RepositoryResult<()> {
        line.check_invariants()
            .map_err(RepositoryError::ValidationError)?;

        let affected = conn.execute(
            r#"
            UPDATE demand_line SET
                transfer_id = ?1, group_id = ?2,
                requested_qty = ?3, reserved_qty = ?4, picked_qty = ?5,
                state = ?6, needs_release = ?7, release_blocked = ?8, released_at = ?9,
                route_id = ?10, no_backorder_at_release = ?11,
                carrier_id = ?12, service_level = ?13, requires_other_lines = ?14,
                priority = ?15, date_priority = ?16, is_backorder_of = ?17,
                revision = revision + 1
            WHERE line_id = ?18 AND revision = ?19
            "#,
            params![
                line.transfer_id,
                line.group_id,
                line.requested_qty.to_string(),
                line.reserved_qty.to_string(),
                line.picked_qty.to_string(),
                line.state.as_str(),
                line.needs_release as i32,
                line.release_blocked as i32,
                fmt_opt_datetime(&line.released_at),
                line.route_id,
                line.no_backorder_at_release as i32,
                line.carrier_id,
                line.service_level,
                line.requires_other_lines as i32,
                line.priority,
                fmt_datetime(&line.date_priority),
                line.is_backorder_of,
                line.line_id,
                line.revision,
            ],
        )?;

        if affected == 0 {
            return Err(RepositoryError::OptimisticLockFailure {
                entity: "DemandLine".to_string(),
                id: line.line_id.clone(),
                expected: line.revision,
            });
        }

        line.revision += 1;
        Ok(())
    }

    pub fn update(&self, line: &mut DemandLine) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        Self::update_with(&conn, line)
    }

    // ==========================================
    // 查询
    // ==========================================

    pub fn find_by_id_with(conn: &Connection, line_id: &str) -> RepositoryResult<Option<DemandLine>> {
        let line = conn
            .query_row(
                &format!("{} WHERE line_id = ?1", SELECT_COLUMNS),
                params![line_id],
                map_row,
            )
            .optional()?;
        Ok(line)
    }

    pub fn find_by_id(&self, line_id: &str) -> RepositoryResult<Option<DemandLine>> {
        let conn = self.get_conn()?;
        Self::find_by_id_with(&conn, line_id)
    }

    pub fn find_by_ids(&self, line_ids: &[String]) -> RepositoryResult<Vec<DemandLine>> {
        if line_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.get_conn()?;
        let placeholders = vec!["?"; line_ids.len()].join(", ");
        let mut stmt = conn.prepare(&format!(
            "{} WHERE line_id IN ({}) {}",
            SELECT_COLUMNS, placeholders, PROMISE_ORDER
        ))?;
        let lines = stmt
            .query_map(params_from_iter(line_ids.iter()), map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(lines)
    }

    /// 调拨单的全部需求行 (承诺顺序)
    pub fn find_by_transfer_with(
        conn: &Connection,
        transfer_id: &str,
    ) -> RepositoryResult<Vec<DemandLine>> {
        let mut stmt = conn.prepare(&format!(
            "{} WHERE transfer_id = ?1 {}",
            SELECT_COLUMNS, PROMISE_ORDER
        ))?;
        let lines = stmt
            .query_map(params![transfer_id], map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(lines)
    }

    pub fn find_by_transfer(&self, transfer_id: &str) -> RepositoryResult<Vec<DemandLine>> {
        let conn = self.get_conn()?;
        Self::find_by_transfer_with(&conn, transfer_id)
    }

    /// 指定产品上所有非终态的需求行 (可用量计算的竞争集合)
    pub fn find_active_by_product_with(
        conn: &Connection,
        product_id: &str,
    ) -> RepositoryResult<Vec<DemandLine>> {
        let mut stmt = conn.prepare(&format!(
            "{} WHERE product_id = ?1 AND state NOT IN ('done', 'cancelled') {}",
            SELECT_COLUMNS, PROMISE_ORDER
        ))?;
        let lines = stmt
            .query_map(params![product_id], map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(lines)
    }

    pub fn find_active_by_product(&self, product_id: &str) -> RepositoryResult<Vec<DemandLine>> {
        let conn = self.get_conn()?;
        Self::find_active_by_product_with(&conn, product_id)
    }

    // ==========================================
    // 统计
    // ==========================================

    pub fn count_needs_release_by_product(&self, product_id: &str) -> RepositoryResult<i64> {
        let conn = self.get_conn()?;
        let count = conn.query_row(
            r#"
            SELECT COUNT(*) FROM demand_line
            WHERE product_id = ?1 AND needs_release = 1
              AND state NOT IN ('done', 'cancelled')
            "#,
            params![product_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn count_needs_release_by_transfer(&self, transfer_id: &str) -> RepositoryResult<i64> {
        let conn = self.get_conn()?;
        let count = conn.query_row(
            r#"
            SELECT COUNT(*) FROM demand_line
            WHERE transfer_id = ?1 AND needs_release = 1
              AND state NOT IN ('done', 'cancelled')
            "#,
            params![transfer_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<DemandLine> {
    let state_raw: String = row.get(10)?;
    let state = LineState::parse(&state_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            10,
            rusqlite::types::Type::Text,
            format!("未知需求行状态: {}", state_raw).into(),
        )
    })?;

    Ok(DemandLine {
        line_id: row.get(0)?,
        transfer_id: row.get(1)?,
        group_id: row.get(2)?,
        product_id: row.get(3)?,
        source_location_id: row.get(4)?,
        dest_location_id: row.get(5)?,
        uom_rounding: decimal_at(row, 6)?,
        requested_qty: decimal_at(row, 7)?,
        reserved_qty: decimal_at(row, 8)?,
        picked_qty: decimal_at(row, 9)?,
        state,
        needs_release: row.get::<_, i32>(11)? != 0,
        release_blocked: row.get::<_, i32>(12)? != 0,
        released_at: opt_datetime_at(row, 13)?,
        route_id: row.get(14)?,
        no_backorder_at_release: row.get::<_, i32>(15)? != 0,
        carrier_id: row.get(16)?,
        service_level: row.get(17)?,
        requires_other_lines: row.get::<_, i32>(18)? != 0,
        priority: row.get(19)?,
        date_priority: datetime_at(row, 20)?,
        is_backorder_of: row.get(21)?,
        revision: row.get(22)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::schema::ensure_schema;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn setup() -> Arc<Mutex<Connection>> {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();
        conn.execute_batch(
            r#"
            INSERT INTO transfer (transfer_id, name, shipping_policy, scheduled_date, confirmed_at)
            VALUES ('T1', 'OUT/001', 'as_soon_as_possible', '2026-03-02 08:00:00', '2026-03-01 08:00:00');
            "#,
        )
        .unwrap();
        Arc::new(Mutex::new(conn))
    }

    fn line(id: &str, priority: i32, day: u32) -> DemandLine {
        DemandLine {
            line_id: id.to_string(),
            transfer_id: "T1".to_string(),
            group_id: None,
            product_id: "P1".to_string(),
            source_location_id: "WH".to_string(),
            dest_location_id: "CUSTOMER".to_string(),
            uom_rounding: dec!(1),
            requested_qty: dec!(10),
            reserved_qty: dec!(0),
            picked_qty: dec!(0),
            state: LineState::Confirmed,
            needs_release: true,
            release_blocked: false,
            released_at: None,
            route_id: None,
            no_backorder_at_release: false,
            carrier_id: None,
            service_level: None,
            requires_other_lines: false,
            priority,
            date_priority: NaiveDate::from_ymd_opt(2026, 3, day)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
            is_backorder_of: None,
            revision: 0,
        }
    }

    #[test]
    fn test_promise_order() {
        let repo = DemandLineRepository::new(setup());
        repo.insert(&line("L3", 0, 1)).unwrap();
        repo.insert(&line("L2", 0, 2)).unwrap();
        repo.insert(&line("L1", 1, 9)).unwrap();
        repo.insert(&line("L0", 0, 1)).unwrap();

        let ids: Vec<String> = repo
            .find_by_transfer("T1")
            .unwrap()
            .into_iter()
            .map(|l| l.line_id)
            .collect();
        assert_eq!(ids, vec!["L1", "L0", "L3", "L2"]);
    }

    #[test]
    fn test_optimistic_update() {
        let repo = DemandLineRepository::new(setup());
        repo.insert(&line("L1", 0, 1)).unwrap();

        let mut a = repo.find_by_id("L1").unwrap().unwrap();
        let mut b = a.clone();

        a.release_blocked = true;
        repo.update(&mut a).unwrap();
        assert_eq!(a.revision, 1);

        b.priority = 5;
        let err = repo.update(&mut b).unwrap_err();
        assert!(err.is_contention());

        let stored = repo.find_by_id("L1").unwrap().unwrap();
        assert!(stored.release_blocked);
        assert_eq!(stored.priority, 0);
    }

    #[test]
    fn test_counts_ignore_terminal_lines() {
        let repo = DemandLineRepository::new(setup());
        repo.insert(&line("L1", 0, 1)).unwrap();
        let mut done = line("L2", 0, 1);
        done.state = LineState::Done;
        repo.insert(&done).unwrap();

        assert_eq!(repo.count_needs_release_by_product("P1").unwrap(), 1);
        assert_eq!(repo.count_needs_release_by_transfer("T1").unwrap(), 1);
        assert_eq!(repo.find_active_by_product("P1").unwrap().len(), 1);
    }

    #[test]
    fn test_reject_invalid_quantities() {
        let repo = DemandLineRepository::new(setup());
        let mut bad = line("L1", 0, 1);
        bad.reserved_qty = dec!(11);
        assert!(repo.insert(&bad).is_err());
    }
}

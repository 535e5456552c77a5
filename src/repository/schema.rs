// ==========================================
// 仓库出库释放系统 - 数据库结构
// ==========================================
// 职责: 幂等建表 + 行字段编解码辅助
// 约定: 数量以十进制文本存储,时间格式 %Y-%m-%d %H:%M:%S
// ==========================================

use crate::db::CURRENT_SCHEMA_VERSION;
use crate::repository::error::RepositoryResult;
use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use std::str::FromStr;

pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// 幂等创建全部表
pub fn ensure_schema(conn: &Connection) -> RepositoryResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS config_kv (
            scope_id TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (scope_id, key)
        );

        CREATE TABLE IF NOT EXISTS location (
            location_id TEXT PRIMARY KEY,
            parent_id TEXT REFERENCES location(location_id),
            path TEXT NOT NULL,
            excluded_from_usable INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS stock_quant (
            product_id TEXT NOT NULL,
            location_id TEXT NOT NULL REFERENCES location(location_id),
            quantity TEXT NOT NULL,
            PRIMARY KEY (product_id, location_id)
        );

        CREATE TABLE IF NOT EXISTS stock_incoming (
            incoming_id TEXT PRIMARY KEY,
            product_id TEXT NOT NULL,
            location_id TEXT NOT NULL REFERENCES location(location_id),
            quantity TEXT NOT NULL,
            expected_date TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS public_holiday (
            holiday_date TEXT PRIMARY KEY,
            name TEXT
        );

        CREATE TABLE IF NOT EXISTS channel_preparation_plan (
            plan_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            last_launch_date TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS release_channel (
            channel_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            sequence INTEGER NOT NULL DEFAULT 10,
            state TEXT NOT NULL DEFAULT 'draft',
            batch_mode TEXT NOT NULL DEFAULT 'manual',
            partner_ids_json TEXT NOT NULL DEFAULT '[]',
            carrier_ids_json TEXT NOT NULL DEFAULT '[]',
            delivery_weekdays_json TEXT NOT NULL DEFAULT '[]',
            geo_zone_json TEXT,
            warehouse_id TEXT,
            exclude_public_holidays INTEGER NOT NULL DEFAULT 0,
            preparation_plan_id TEXT REFERENCES channel_preparation_plan(plan_id),
            last_wake_date TEXT,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS transfer (
            transfer_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            partner_id TEXT,
            commercial_partner_id TEXT,
            carrier_id TEXT,
            warehouse_id TEXT,
            delivery_lat REAL,
            delivery_lon REAL,
            shipping_policy TEXT NOT NULL,
            scheduled_date TEXT NOT NULL,
            commitment_date TEXT,
            release_channel_id TEXT REFERENCES release_channel(channel_id),
            last_release_date TEXT,
            confirmed_at TEXT NOT NULL,
            needs_release INTEGER NOT NULL DEFAULT 0,
            is_closed INTEGER NOT NULL DEFAULT 0,
            backorder_of TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_transfer_channel
          ON transfer(release_channel_id, needs_release);

        CREATE TABLE IF NOT EXISTS demand_line (
            line_id TEXT PRIMARY KEY,
            transfer_id TEXT NOT NULL REFERENCES transfer(transfer_id),
            group_id TEXT,
            product_id TEXT NOT NULL,
            source_location_id TEXT NOT NULL,
            dest_location_id TEXT NOT NULL,
            uom_rounding TEXT NOT NULL,
            requested_qty TEXT NOT NULL,
            reserved_qty TEXT NOT NULL DEFAULT '0',
            picked_qty TEXT NOT NULL DEFAULT '0',
            state TEXT NOT NULL,
            needs_release INTEGER NOT NULL DEFAULT 0,
            release_blocked INTEGER NOT NULL DEFAULT 0,
            released_at TEXT,
            route_id TEXT,
            no_backorder_at_release INTEGER NOT NULL DEFAULT 0,
            carrier_id TEXT,
            service_level TEXT,
            requires_other_lines INTEGER NOT NULL DEFAULT 0,
            priority INTEGER NOT NULL DEFAULT 0,
            date_priority TEXT NOT NULL,
            is_backorder_of TEXT,
            revision INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_demand_line_transfer
          ON demand_line(transfer_id);

        CREATE INDEX IF NOT EXISTS idx_demand_line_product
          ON demand_line(product_id, state);

        CREATE TABLE IF NOT EXISTS transfer_lock (
            transfer_id TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            acquired_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS action_log (
            action_id TEXT PRIMARY KEY,
            action_type TEXT NOT NULL,
            action_ts TEXT NOT NULL,
            actor TEXT NOT NULL,
            transfer_id TEXT,
            channel_id TEXT,
            payload_json TEXT,
            impact_summary_json TEXT,
            detail TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_action_log_transfer
          ON action_log(transfer_id, action_ts);
        "#,
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        params![CURRENT_SCHEMA_VERSION],
    )?;
    Ok(())
}

// ==========================================
// 行字段编解码
// ==========================================

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

pub fn decimal_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(raw.trim()).map_err(|e| conversion_error(idx, e))
}

pub fn datetime_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDateTime> {
    let raw: String = row.get(idx)?;
    parse_datetime(&raw).map_err(|e| conversion_error(idx, e))
}

pub fn opt_datetime_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveDateTime>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_datetime(&s).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

pub fn opt_date_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| NaiveDate::parse_from_str(s.trim(), DATE_FORMAT).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

/// 同时兼容带/不带小数秒的格式
pub fn parse_datetime(raw: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    let s = raw.trim();
    NaiveDateTime::parse_from_str(s, DATETIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
}

pub fn fmt_datetime(dt: &NaiveDateTime) -> String {
    dt.format(DATETIME_FORMAT).to_string()
}

pub fn fmt_opt_datetime(dt: &Option<NaiveDateTime>) -> Option<String> {
    dt.as_ref().map(fmt_datetime)
}

pub fn fmt_opt_date(d: &Option<NaiveDate>) -> Option<String> {
    d.map(|d| d.format(DATE_FORMAT).to_string())
}

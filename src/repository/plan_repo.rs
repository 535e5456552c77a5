// ==========================================
// 仓库出库释放系统 - 备货计划与节假日仓储
// ==========================================

use crate::domain::channel::HolidayCalendar;
use crate::domain::plan::ChannelPreparationPlan;
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::schema::{datetime_at, fmt_datetime, fmt_opt_date, opt_date_at, DATE_FORMAT};
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};

pub struct PlanRepository {
    conn: Arc<Mutex<Connection>>,
}

impl PlanRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    // ==========================================
    // 备货计划
    // ==========================================

    pub fn insert(&self, plan: &ChannelPreparationPlan) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO channel_preparation_plan (plan_id, name, last_launch_date, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                plan.plan_id,
                plan.name,
                fmt_opt_date(&plan.last_launch_date),
                fmt_datetime(&plan.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn find_by_id_with(conn: &Connection, plan_id: &str) -> RepositoryResult<Option<ChannelPreparationPlan>> {
        let plan = conn
            .query_row(
                r#"
                SELECT plan_id, name, last_launch_date, created_at
                FROM channel_preparation_plan WHERE plan_id = ?1
                "#,
                params![plan_id],
                |row| {
                    Ok(ChannelPreparationPlan {
                        plan_id: row.get(0)?,
                        name: row.get(1)?,
                        last_launch_date: opt_date_at(row, 2)?,
                        created_at: datetime_at(row, 3)?,
                    })
                },
            )
            .optional()?;
        Ok(plan)
    }

    pub fn find_by_id(&self, plan_id: &str) -> RepositoryResult<Option<ChannelPreparationPlan>> {
        let conn = self.get_conn()?;
        Self::find_by_id_with(&conn, plan_id)
    }

    pub fn update_last_launch_with(
        conn: &Connection,
        plan_id: &str,
        date: NaiveDate,
    ) -> RepositoryResult<()> {
        conn.execute(
            "UPDATE channel_preparation_plan SET last_launch_date = ?1 WHERE plan_id = ?2",
            params![date.format(DATE_FORMAT).to_string(), plan_id],
        )?;
        Ok(())
    }

    // ==========================================
    // 公共节假日
    // ==========================================

    pub fn add_holiday(&self, date: NaiveDate, name: Option<&str>) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO public_holiday (holiday_date, name) VALUES (?1, ?2)",
            params![date.format(DATE_FORMAT).to_string(), name],
        )?;
        Ok(())
    }

    pub fn load_holiday_calendar_with(conn: &Connection) -> RepositoryResult<HolidayCalendar> {
        let mut stmt = conn.prepare("SELECT holiday_date FROM public_holiday")?;
        let raw = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut dates = Vec::with_capacity(raw.len());
        for s in raw {
            let d = NaiveDate::parse_from_str(&s, DATE_FORMAT).map_err(|e| {
                RepositoryError::FieldValueError {
                    field: "holiday_date".to_string(),
                    message: format!("{}: {}", s, e),
                }
            })?;
            dates.push(d);
        }
        Ok(HolidayCalendar::new(dates))
    }

    pub fn load_holiday_calendar(&self) -> RepositoryResult<HolidayCalendar> {
        let conn = self.get_conn()?;
        Self::load_holiday_calendar_with(&conn)
    }
}

// ==========================================
// 仓库出库释放系统 - 调拨单互斥租约
// ==========================================
// 表: transfer_lock(transfer_id PK, owner, acquired_at, expires_at)
// 规则:
// - 同一调拨单同时至多一个持有者
// - 租约过期后可被其他工作者接管 (防止崩溃后永久占用)
// - 不可重入: 同一持有者重复获取视为争用
// ==========================================

use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::schema::fmt_datetime;
use chrono::{NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferLease {
    pub transfer_id: String,
    pub owner: String,
    pub acquired_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
}

pub struct TransferLockRepository {
    conn: Arc<Mutex<Connection>>,
    lease: chrono::Duration,
}

impl TransferLockRepository {
    pub fn new(db_path: &str, lease_seconds: i64) -> RepositoryResult<Self> {
        let conn = crate::db::open_sqlite_connection(db_path)?;
        Ok(Self::from_connection(Arc::new(Mutex::new(conn)), lease_seconds))
    }

    pub fn from_connection(conn: Arc<Mutex<Connection>>, lease_seconds: i64) -> Self {
        Self {
            conn,
            lease: chrono::Duration::seconds(lease_seconds.max(1)),
        }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    /// 尝试获取租约 (不等待)
    ///
    /// 返回 None 表示已被其他工作者持有且未过期
    pub fn try_acquire(
        &self,
        transfer_id: &str,
        owner: &str,
    ) -> RepositoryResult<Option<TransferLockGuard>> {
        let now = Utc::now().naive_utc();
        let expires_at = now + self.lease;

        let affected = {
            let conn = self.get_conn()?;
            conn.execute(
                r#"
                INSERT INTO transfer_lock (transfer_id, owner, acquired_at, expires_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(transfer_id) DO UPDATE SET
                    owner = excluded.owner,
                    acquired_at = excluded.acquired_at,
                    expires_at = excluded.expires_at
                WHERE transfer_lock.expires_at < excluded.acquired_at
                "#,
                params![transfer_id, owner, fmt_datetime(&now), fmt_datetime(&expires_at)],
            )?
        };

        if affected == 0 {
            tracing::debug!(transfer_id, owner, "调拨单租约被占用");
            return Ok(None);
        }

        Ok(Some(TransferLockGuard {
            conn: Arc::clone(&self.conn),
            transfer_id: transfer_id.to_string(),
            owner: owner.to_string(),
            released: false,
        }))
    }

    /// 有界等待获取租约 (人工入口使用)
    pub fn acquire_with_wait(
        &self,
        transfer_id: &str,
        owner: &str,
        wait: Duration,
    ) -> RepositoryResult<Option<TransferLockGuard>> {
        let deadline = Instant::now() + wait;
        loop {
            match self.try_acquire(transfer_id, owner) {
                Ok(Some(guard)) => return Ok(Some(guard)),
                Ok(None) => {}
                // 租约表本身的写冲突同样视为争用
                Err(e) if e.is_contention() => {}
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(ACQUIRE_POLL_INTERVAL);
        }
    }

    pub fn find_lease(&self, transfer_id: &str) -> RepositoryResult<Option<TransferLease>> {
        let conn = self.get_conn()?;
        let lease = conn
            .query_row(
                "SELECT transfer_id, owner, acquired_at, expires_at FROM transfer_lock WHERE transfer_id = ?1",
                params![transfer_id],
                |row| {
                    Ok(TransferLease {
                        transfer_id: row.get(0)?,
                        owner: row.get(1)?,
                        acquired_at: crate::repository::schema::datetime_at(row, 2)?,
                        expires_at: crate::repository::schema::datetime_at(row, 3)?,
                    })
                },
            )
            .optional()?;
        Ok(lease)
    }

    /// 是否被其他持有者以未过期租约占用
    pub fn is_held_by_other(&self, transfer_id: &str, owner: &str) -> RepositoryResult<bool> {
        let now = Utc::now().naive_utc();
        Ok(match self.find_lease(transfer_id)? {
            Some(lease) => lease.owner != owner && lease.expires_at >= now,
            None => false,
        })
    }
}

/// 租约守卫
///
/// 优先调用 release(); Drop 时仅在连接空闲时释放,否则等待租约自然过期
pub struct TransferLockGuard {
    conn: Arc<Mutex<Connection>>,
    transfer_id: String,
    owner: String,
    released: bool,
}

impl TransferLockGuard {
    pub fn transfer_id(&self) -> &str {
        &self.transfer_id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn release(mut self) -> RepositoryResult<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))?;
        delete_lease(&conn, &self.transfer_id, &self.owner)?;
        self.released = true;
        Ok(())
    }
}

impl Drop for TransferLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match self.conn.try_lock() {
            Ok(conn) => {
                if let Err(e) = delete_lease(&conn, &self.transfer_id, &self.owner) {
                    tracing::warn!(transfer_id = %self.transfer_id, error = %e, "租约释放失败,等待过期");
                }
            }
            Err(_) => {
                tracing::warn!(transfer_id = %self.transfer_id, "连接被占用,租约等待过期");
            }
        }
    }
}

fn delete_lease(conn: &Connection, transfer_id: &str, owner: &str) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM transfer_lock WHERE transfer_id = ?1 AND owner = ?2",
        params![transfer_id, owner],
    )
}

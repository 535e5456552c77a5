// ==========================================
// 仓库出库释放系统 - 作用域检查点
// ==========================================
// 最外层: BEGIN IMMEDIATE 事务 (写者在开头即串行化)
// 嵌套层: SAVEPOINT
// 未显式 commit 的检查点在 Drop 时回滚 (含 panic 展开)
// ==========================================

use crate::repository::error::{RepositoryError, RepositoryResult};
use rusqlite::Connection;

enum CheckpointKind {
    Transaction,
    Savepoint(String),
}

/// 作用域检查点
pub struct ScopedCheckpoint<'c> {
    conn: &'c Connection,
    kind: CheckpointKind,
    finished: bool,
}

impl<'c> ScopedCheckpoint<'c> {
    /// 开启检查点
    ///
    /// 连接处于自动提交模式时开启事务,否则在当前事务内建立保存点
    pub fn begin(conn: &'c Connection, name: &str) -> RepositoryResult<Self> {
        let kind = if conn.is_autocommit() {
            conn.execute_batch("BEGIN IMMEDIATE")?;
            CheckpointKind::Transaction
        } else {
            let sp = savepoint_name(name);
            conn.execute_batch(&format!("SAVEPOINT {}", sp))?;
            CheckpointKind::Savepoint(sp)
        };

        Ok(Self {
            conn,
            kind,
            finished: false,
        })
    }

    pub fn conn(&self) -> &Connection {
        self.conn
    }

    /// 提交; 失败时检查点仍未结束,随 Drop 回滚
    pub fn commit(mut self) -> RepositoryResult<()> {
        match &self.kind {
            CheckpointKind::Transaction => self.conn.execute_batch("COMMIT")?,
            CheckpointKind::Savepoint(sp) => {
                self.conn.execute_batch(&format!("RELEASE {}", sp))?
            }
        }
        self.finished = true;
        Ok(())
    }

    pub fn rollback(mut self) -> RepositoryResult<()> {
        self.rollback_inner()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;
        self.finished = true;
        Ok(())
    }

    fn rollback_inner(&self) -> rusqlite::Result<()> {
        match &self.kind {
            CheckpointKind::Transaction => self.conn.execute_batch("ROLLBACK"),
            CheckpointKind::Savepoint(sp) => self
                .conn
                .execute_batch(&format!("ROLLBACK TO {sp}; RELEASE {sp}", sp = sp)),
        }
    }
}

impl Drop for ScopedCheckpoint<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.rollback_inner() {
            tracing::warn!(error = %e, "检查点回滚失败");
        }
    }
}

fn savepoint_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("sp_{}", cleaned)
}

/// 在检查点内执行闭包: Ok 提交, Err 回滚
pub fn run_in_checkpoint<T, E, F>(conn: &Connection, name: &str, f: F) -> Result<T, E>
where
    F: FnOnce(&Connection) -> Result<T, E>,
    E: From<RepositoryError>,
{
    let checkpoint = ScopedCheckpoint::begin(conn, name)?;
    let value = f(checkpoint.conn())?;
    checkpoint.commit()?;
    Ok(value)
}

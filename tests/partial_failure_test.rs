// ==========================================
// 批次内单据级失败集成测试
// ==========================================
// 职责: 单个调拨单失败时本批其余调拨单继续; 存储不可用时整体中止
// ==========================================


#[cfg(test)]
mod partial_failure_test {
    use chrono::NaiveDateTime;
    use outbound_release::api::{ApiError, ReleaseApi, ReleaseOutcome};
    use outbound_release::config::ReleaseConfig;
    use outbound_release::db::open_shared_connection;
    use outbound_release::domain::types::{BatchMode, ChannelState, SkipReason};
    use outbound_release::engine::availability::{LocationQuantity, QuantityLedger};
    use outbound_release::engine::driver::{PassOptions, SchedulerDriver};
    use outbound_release::engine::release_service::ReleaseService;
    use outbound_release::engine::ReleaseContext;
    use outbound_release::repository::{
        ChannelRepository, DemandLineRepository, RepositoryError, RepositoryResult,
        SqliteQuantityLedger, TransferLockRepository, TransferRepository,
    };
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    use crate::test_helpers::*;

    /// 指定产品读取失败的账本
    struct FaultyLedger {
        inner: SqliteQuantityLedger,
        faults: Vec<(&'static str, fn() -> RepositoryError)>,
    }

    impl QuantityLedger for FaultyLedger {
        fn location_path(&self, location_id: &str) -> RepositoryResult<Option<String>> {
            self.inner.location_path(location_id)
        }

        fn location_quantities(
            &self,
            product_id: &str,
            location_subtree: &str,
            horizon: NaiveDateTime,
        ) -> RepositoryResult<Vec<LocationQuantity>> {
            if let Some((_, fault)) = self.faults.iter().find(|(p, _)| *p == product_id) {
                return Err(fault());
            }
            self.inner.location_quantities(product_id, location_subtree, horizon)
        }
    }

    struct Harness {
        api: ReleaseApi,
        driver: SchedulerDriver,
        ctx: ReleaseContext,
    }

    fn harness(db_path: &str, faults: Vec<(&'static str, fn() -> RepositoryError)>) -> Harness {
        let conn = open_shared_connection(db_path).unwrap();
        let config = ReleaseConfig::default();
        let ledger = FaultyLedger {
            inner: SqliteQuantityLedger::new(db_path).unwrap(),
            faults,
        };
        let locks = Arc::new(TransferLockRepository::new(db_path, config.lock_lease_seconds).unwrap());
        let service = Arc::new(ReleaseService::new(conn.clone(), locks, Arc::new(ledger), &config));
        let transfer_repo = Arc::new(TransferRepository::new(conn.clone()));
        let channel_repo = Arc::new(ChannelRepository::new(conn.clone()));
        let line_repo = Arc::new(DemandLineRepository::new(conn));

        Harness {
            api: ReleaseApi::new(service.clone(), transfer_repo.clone(), line_repo, channel_repo.clone()),
            driver: SchedulerDriver::new(service, channel_repo, transfer_repo),
            ctx: ReleaseContext::from_config("operator", test_now(), &config),
        }
    }

    fn query_failure() -> RepositoryError {
        RepositoryError::DatabaseQueryError("磁盘读取异常".to_string())
    }

    fn busy() -> RepositoryError {
        RepositoryError::Busy("database is locked".to_string())
    }

    fn connection_lost() -> RepositoryError {
        RepositoryError::DatabaseConnectionError("连接已断开".to_string())
    }

    // ==========================================
    // 人工批次: 失败的调拨单记为跳过, 其余照常提交
    // ==========================================
    #[test]
    fn test_manual_batch_continues_after_failed_transfer() {
        let (_file, db_path) = create_test_db().unwrap();
        seed_simple(&db_path, "T1", "BROKEN", dec!(1));
        seed_simple(&db_path, "T2", "JAMMED", dec!(1));
        seed_simple(&db_path, "T3", "P1", dec!(2));
        set_on_hand(&db_path, "P1", dec!(2));

        let h = harness(&db_path, vec![("BROKEN", query_failure), ("JAMMED", busy)]);
        let report = h
            .api
            .release_transfers(&h.ctx, &["T1".to_string(), "T2".to_string(), "T3".to_string()])
            .unwrap();

        assert_eq!(report.outcome, ReleaseOutcome::Partial);
        assert_eq!(report.released_count, 1);
        assert_eq!(report.skipped_count, 2);
        assert_eq!(report.failed_transfer_ids, vec!["T1".to_string()]);

        let skip_of = |line_id: &str| {
            report
                .lines
                .iter()
                .find(|l| l.line_id == line_id)
                .and_then(|l| l.skip)
        };
        assert_eq!(skip_of("T1-L1"), Some(SkipReason::Failed));
        assert_eq!(skip_of("T2-L1"), Some(SkipReason::LockedByOtherWorker));
        assert_eq!(skip_of("T3-L1"), None);

        // 失败的工作单元已回滚
        assert!(load_line(&db_path, "T1-L1").needs_release);
        assert!(!load_line(&db_path, "T3-L1").needs_release);
    }

    #[test]
    fn test_release_lines_reports_failed_transfer() {
        let (_file, db_path) = create_test_db().unwrap();
        seed_simple(&db_path, "T1", "P1", dec!(1));
        seed_simple(&db_path, "T2", "BROKEN", dec!(1));
        set_on_hand(&db_path, "P1", dec!(1));

        let h = harness(&db_path, vec![("BROKEN", query_failure)]);
        let report = h
            .api
            .release_lines(&h.ctx, &["T2-L1".to_string(), "T1-L1".to_string()])
            .unwrap();
        assert_eq!(report.released_count, 1);
        assert_eq!(report.failed_transfer_ids, vec!["T2".to_string()]);
        assert_eq!(report.skip_summary().get("failed"), Some(&1));
    }

    #[test]
    fn test_storage_outage_aborts_manual_batch() {
        let (_file, db_path) = create_test_db().unwrap();
        seed_simple(&db_path, "T1", "OFFLINE", dec!(1));

        let h = harness(&db_path, vec![("OFFLINE", connection_lost)]);
        let err = h.api.release_transfers(&h.ctx, &["T1".to_string()]).unwrap_err();
        assert!(matches!(err, ApiError::DatabaseConnectionError(_)));
    }

    // ==========================================
    // 调度轮次: 通道预筛争用时跳过该通道, 其余通道继续
    // ==========================================
    #[test]
    fn test_contended_channel_is_skipped_for_this_pass() {
        let (_file, db_path) = create_test_db().unwrap();
        seed_channel(&db_path, &channel("A", 1, BatchMode::Automatic, ChannelState::Open));
        seed_channel(&db_path, &channel("B", 2, BatchMode::Automatic, ChannelState::Open));
        let mut t1 = transfer("T1");
        t1.release_channel_id = Some("A".to_string());
        seed_transfer(&db_path, &t1, &[line("T1-L1", "T1", "JAMMED", dec!(1))]);
        let mut t2 = transfer("T2");
        t2.release_channel_id = Some("B".to_string());
        seed_transfer(&db_path, &t2, &[line("T2-L1", "T2", "P1", dec!(1))]);
        set_on_hand(&db_path, "P1", dec!(1));

        let h = harness(&db_path, vec![("JAMMED", busy)]);
        let report = h.driver.run_pass(&h.ctx, &PassOptions::scheduled()).unwrap();

        assert_eq!(report.channels, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(report.skipped_channels, vec!["A".to_string()]);
        assert_eq!(report.released, vec!["T2".to_string()]);
        assert!(load_line(&db_path, "T1-L1").needs_release);
    }

    #[test]
    fn test_storage_outage_aborts_pass() {
        let (_file, db_path) = create_test_db().unwrap();
        seed_channel(&db_path, &channel("A", 1, BatchMode::Automatic, ChannelState::Open));
        let mut t1 = transfer("T1");
        t1.release_channel_id = Some("A".to_string());
        seed_transfer(&db_path, &t1, &[line("T1-L1", "T1", "OFFLINE", dec!(1))]);

        let h = harness(&db_path, vec![("OFFLINE", connection_lost)]);
        let err = h.driver.run_pass(&h.ctx, &PassOptions::scheduled()).unwrap_err();
        assert!(err.is_fatal());
    }
}

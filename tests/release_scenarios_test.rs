// ==========================================
// 释放场景集成测试
// ==========================================
// 职责: 验证整单/部分/禁止欠单/边界/整单发货等释放路径
// ==========================================


#[cfg(test)]
mod release_scenarios_test {
    use outbound_release::api::{ApiError, ReleaseOutcome};
    use outbound_release::domain::types::{
        BatchMode, ChannelState, LineState, ShippingPolicy, SkipReason,
    };
    use outbound_release::engine::splitter::MoveSplitter;
    use rust_decimal_macros::dec;

    use crate::test_helpers::*;

    // ==========================================
    // 场景 A: 库存充足, 整单释放
    // ==========================================
    #[test]
    fn test_full_release_clears_needs_release() {
        let (_file, db_path) = create_test_db().unwrap();
        seed_simple(&db_path, "T1", "P1", dec!(10));
        set_on_hand(&db_path, "P1", dec!(10));

        let state = build_state(&db_path);
        let ctx = state.context("operator", test_now());
        let report = state
            .release_api
            .release_transfers(&ctx, &["T1".to_string()])
            .unwrap();

        assert_eq!(report.outcome, ReleaseOutcome::Ok);
        assert_eq!(report.released_count, 1);
        assert!(report.backorder_transfer_ids.is_empty());

        let line = load_line(&db_path, "T1-L1");
        assert_eq!(line.reserved_qty, dec!(10));
        assert_eq!(line.state, LineState::Assigned);
        assert!(!line.needs_release);

        let transfer = load_transfer(&db_path, "T1");
        assert!(!transfer.needs_release);
        assert_eq!(transfer.last_release_date, Some(test_now()));
        assert_eq!(count_actions(&db_path, "RELEASE"), 1);
    }

    // ==========================================
    // 场景 B: 部分可用, 拆出欠单并独立分配
    // ==========================================
    #[test]
    fn test_partial_release_creates_assigned_backorder() {
        let (_file, db_path) = create_test_db().unwrap();
        seed_channel(
            &db_path,
            &channel("C-AUTO", 10, BatchMode::Automatic, ChannelState::Open),
        );
        seed_simple(&db_path, "T1", "P1", dec!(10));
        set_on_hand(&db_path, "P1", dec!(4));

        let state = build_state(&db_path);
        let ctx = state.context("operator", test_now());
        let report = state
            .release_api
            .release_transfers(&ctx, &["T1".to_string()])
            .unwrap();

        assert_eq!(report.outcome, ReleaseOutcome::Partial);
        assert_eq!(report.released_count, 1);
        assert_eq!(report.lines[0].released_qty, dec!(4));
        assert_eq!(report.backorder_transfer_ids.len(), 1);

        let released = load_line(&db_path, "T1-L1");
        assert_eq!(released.requested_qty, dec!(4));
        assert_eq!(released.reserved_qty, dec!(4));

        let bo_id = &report.backorder_transfer_ids[0];
        let bo_transfer = load_transfer(&db_path, bo_id);
        assert_eq!(bo_transfer.backorder_of.as_deref(), Some("T1"));
        assert_eq!(bo_transfer.release_channel_id.as_deref(), Some("C-AUTO"));
        assert!(bo_transfer.needs_release);

        let bo_lines = load_lines(&db_path, bo_id);
        assert_eq!(bo_lines.len(), 1);
        assert_eq!(bo_lines[0].requested_qty, dec!(6));
        assert_eq!(bo_lines[0].is_backorder_of.as_deref(), Some("T1-L1"));
        assert_eq!(bo_lines[0].reserved_qty, dec!(0));

        // 拆分守恒
        assert_eq!(released.requested_qty + bo_lines[0].requested_qty, dec!(10));
    }

    // ==========================================
    // 场景 C: 路由禁止欠单, 部分可用时不释放
    // ==========================================
    #[test]
    fn test_no_backorder_route_keeps_line_untouched() {
        let (_file, db_path) = create_test_db().unwrap();
        let t = transfer("T1");
        let mut l = line("T1-L1", "T1", "P1", dec!(10));
        l.no_backorder_at_release = true;
        seed_transfer(&db_path, &t, &[l]);
        set_on_hand(&db_path, "P1", dec!(4));

        let state = build_state(&db_path);
        let ctx = state.context("operator", test_now());
        let report = state
            .release_api
            .release_transfers(&ctx, &["T1".to_string()])
            .unwrap();

        assert_eq!(report.outcome, ReleaseOutcome::NotReady);
        assert_eq!(report.released_count, 0);
        assert_eq!(report.lines[0].skip, Some(SkipReason::NotReady));

        let line = load_line(&db_path, "T1-L1");
        assert_eq!(line.requested_qty, dec!(10));
        assert_eq!(line.reserved_qty, dec!(0));
        assert!(line.needs_release);
        assert_eq!(load_lines(&db_path, "T1").len(), 1);
    }

    // ==========================================
    // 边界: 可用量恰好等于需求量 → 整单就绪, 不拆分
    // ==========================================
    #[test]
    fn test_exact_availability_is_full_not_partial() {
        let (_file, db_path) = create_test_db().unwrap();
        let t = transfer("T1");
        let mut l = line("T1-L1", "T1", "P1", dec!(2.50));
        l.uom_rounding = dec!(0.01);
        seed_transfer(&db_path, &t, &[l]);
        set_on_hand(&db_path, "P1", dec!(2.5));

        let state = build_state(&db_path);
        let ctx = state.context("operator", test_now());
        let report = state
            .release_api
            .release_transfers(&ctx, &["T1".to_string()])
            .unwrap();

        assert_eq!(report.outcome, ReleaseOutcome::Ok);
        assert!(report.lines[0].backorder_line_id.is_none());
        assert!(report.backorder_transfer_ids.is_empty());
    }

    // ==========================================
    // 拆分守恒 (小数计量单位) 与 拆分→合并 还原
    // ==========================================
    #[test]
    fn test_split_then_merge_restores_requested_quantity() {
        let splitter = MoveSplitter::new();
        let mut original = line("L1", "T1", "P1", dec!(7.35));
        original.uom_rounding = dec!(0.05);

        let mut backorder = splitter
            .split(&mut original, dec!(2.17))
            .unwrap()
            .expect("部分数量应产生欠单行");

        // 释放数量按计量精度向下取整
        assert_eq!(original.requested_qty, dec!(2.15));
        assert_eq!(backorder.requested_qty, dec!(5.20));
        assert_eq!(original.requested_qty + backorder.requested_qty, dec!(7.35));

        splitter.merge(&mut original, &mut backorder).unwrap();
        assert_eq!(original.requested_qty, dec!(7.35));
    }

    #[test]
    fn test_merge_rejected_after_picking_started() {
        let splitter = MoveSplitter::new();
        let mut original = line("L1", "T1", "P1", dec!(10));
        let mut backorder = splitter.split(&mut original, dec!(4)).unwrap().unwrap();
        original.picked_qty = dec!(1);

        assert!(splitter.can_merge(&original, &backorder).is_err());
        assert!(splitter.merge(&mut original, &mut backorder).is_err());
        assert_eq!(original.requested_qty, dec!(4));
        assert_eq!(backorder.requested_qty, dec!(6));
    }

    // ==========================================
    // 整单发货: 部分就绪时整单不释放
    // ==========================================
    #[test]
    fn test_all_at_once_waits_for_every_line() {
        let (_file, db_path) = create_test_db().unwrap();
        let mut t = transfer("T1");
        t.shipping_policy = ShippingPolicy::AllAtOnce;
        seed_transfer(
            &db_path,
            &t,
            &[
                line("T1-L1", "T1", "P1", dec!(5)),
                line("T1-L2", "T1", "P2", dec!(5)),
            ],
        );
        set_on_hand(&db_path, "P1", dec!(5));
        set_on_hand(&db_path, "P2", dec!(3));

        let state = build_state(&db_path);
        let ctx = state.context("operator", test_now());

        // 只指定一行也按整单评估
        let report = state
            .release_api
            .release_lines(&ctx, &["T1-L1".to_string()])
            .unwrap();
        assert_eq!(report.released_count, 0);
        assert_eq!(report.lines.len(), 2);
        assert!(load_line(&db_path, "T1-L1").needs_release);

        set_on_hand(&db_path, "P2", dec!(5));
        let report = state
            .release_api
            .release_lines(&ctx, &["T1-L1".to_string()])
            .unwrap();
        assert_eq!(report.outcome, ReleaseOutcome::Ok);
        assert_eq!(report.released_count, 2);
    }

    // ==========================================
    // 阻断 / 已取消 / 未知行
    // ==========================================
    #[test]
    fn test_blocked_line_reports_blocked_outcome() {
        let (_file, db_path) = create_test_db().unwrap();
        seed_simple(&db_path, "T1", "P1", dec!(5));
        set_on_hand(&db_path, "P1", dec!(5));

        let state = build_state(&db_path);
        let ctx = state.context("operator", test_now());
        state.release_api.set_release_blocked(&ctx, "T1-L1", true).unwrap();

        let report = state
            .release_api
            .release_transfers(&ctx, &["T1".to_string()])
            .unwrap();
        assert_eq!(report.outcome, ReleaseOutcome::Blocked);
        assert_eq!(report.lines[0].skip, Some(SkipReason::Blocked));
        assert_eq!(count_actions(&db_path, "BLOCK_RELEASE"), 1);

        state.release_api.set_release_blocked(&ctx, "T1-L1", false).unwrap();
        let report = state
            .release_api
            .release_transfers(&ctx, &["T1".to_string()])
            .unwrap();
        assert_eq!(report.outcome, ReleaseOutcome::Ok);
    }

    #[test]
    fn test_cancelled_line_is_skipped_with_reason() {
        let (_file, db_path) = create_test_db().unwrap();
        let t = transfer("T1");
        seed_transfer(
            &db_path,
            &t,
            &[
                line("T1-L1", "T1", "P1", dec!(5)),
                line("T1-L2", "T1", "P1", dec!(5)),
            ],
        );
        set_on_hand(&db_path, "P1", dec!(10));

        let state = build_state(&db_path);
        let ctx = state.context("operator", test_now());
        let cancelled = state
            .release_api
            .cancel_lines(&ctx, "T1", &["T1-L2".to_string()])
            .unwrap();
        assert!(cancelled[0].is_released());
        assert_eq!(load_line(&db_path, "T1-L2").state, LineState::Cancelled);

        let report = state
            .release_api
            .release_lines(&ctx, &["T1-L1".to_string(), "T1-L2".to_string()])
            .unwrap();
        assert_eq!(report.outcome, ReleaseOutcome::Partial);
        assert_eq!(report.released_count, 1);
        let skipped: Vec<_> = report.lines.iter().filter_map(|l| l.skip).collect();
        assert_eq!(skipped, vec![SkipReason::Cancelled]);
    }

    #[test]
    fn test_unknown_ids_are_rejected_before_any_work() {
        let (_file, db_path) = create_test_db().unwrap();
        seed_simple(&db_path, "T1", "P1", dec!(5));
        set_on_hand(&db_path, "P1", dec!(5));

        let state = build_state(&db_path);
        let ctx = state.context("operator", test_now());
        let err = state
            .release_api
            .release_transfers(&ctx, &["T1".to_string(), "missing".to_string()])
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
        assert!(load_line(&db_path, "T1-L1").needs_release);

        let err = state
            .release_api
            .release_lines(&ctx, &["nope".to_string()])
            .unwrap_err();
        assert_eq!(err.reason_code(), "not_found");
    }

    // ==========================================
    // 先到先得: 优先级高的需求先承诺库存
    // ==========================================
    #[test]
    fn test_higher_priority_line_is_promised_first() {
        let (_file, db_path) = create_test_db().unwrap();
        let mut urgent = line("T2-L1", "T2", "P1", dec!(6));
        urgent.priority = 1;
        seed_transfer(&db_path, &transfer("T1"), &[line("T1-L1", "T1", "P1", dec!(6))]);
        seed_transfer(&db_path, &transfer("T2"), &[urgent]);
        set_on_hand(&db_path, "P1", dec!(6));

        let state = build_state(&db_path);
        let ctx = state.context("operator", test_now());
        let report = state
            .release_api
            .release_transfers(&ctx, &["T1".to_string()])
            .unwrap();
        assert_eq!(report.outcome, ReleaseOutcome::NotReady);

        let report = state
            .release_api
            .release_transfers(&ctx, &["T2".to_string()])
            .unwrap();
        assert_eq!(report.outcome, ReleaseOutcome::Ok);
    }

    #[test]
    fn test_needs_release_counts() {
        let (_file, db_path) = create_test_db().unwrap();
        seed_simple(&db_path, "T1", "P1", dec!(5));
        seed_simple(&db_path, "T2", "P1", dec!(5));
        set_on_hand(&db_path, "P1", dec!(5));

        let state = build_state(&db_path);
        assert_eq!(state.release_api.needs_release_count_for_product("P1").unwrap(), 2);

        let ctx = state.context("operator", test_now());
        state
            .release_api
            .release_transfers(&ctx, &["T1".to_string()])
            .unwrap();
        assert_eq!(state.release_api.needs_release_count_for_product("P1").unwrap(), 1);
        assert_eq!(state.release_api.needs_release_count_for_transfer("T1").unwrap(), 0);
        assert!(state.release_api.needs_release_count_for_product(" ").is_err());
    }

    // ==========================================
    // 来源子树: 其他仓库的需求不占用本仓库存
    // ==========================================
    #[test]
    fn test_other_warehouse_demand_does_not_compete() {
        let (_file, db_path) = create_test_db().unwrap();
        let state = build_state(&db_path);
        state.ledger.insert_location("WH2", None, false).unwrap();
        state.ledger.set_on_hand("P1", "WH2", dec!(10)).unwrap();

        // WH 无库存的高优先级需求
        let mut urgent = line("A-L1", "A", "P1", dec!(10));
        urgent.priority = 5;
        seed_transfer(&db_path, &transfer("A"), &[urgent]);
        let mut remote = line("B-L1", "B", "P1", dec!(10));
        remote.source_location_id = "WH2".to_string();
        seed_transfer(&db_path, &transfer("B"), &[remote]);

        let ctx = state.context("operator", test_now());
        let report = state
            .release_api
            .release_transfers(&ctx, &["B".to_string()])
            .unwrap();
        assert_eq!(report.outcome, ReleaseOutcome::Ok);
        assert_eq!(report.released_count, 1);
        assert_eq!(load_line(&db_path, "B-L1").reserved_qty, dec!(10));

        let report = state
            .release_api
            .release_transfers(&ctx, &["A".to_string()])
            .unwrap();
        assert_eq!(report.released_count, 0);
    }

    // ==========================================
    // 嵌套子树: 子库位需求与父库位需求相互竞争
    // ==========================================
    #[test]
    fn test_nested_subtree_demand_competes() {
        let (_file, db_path) = create_test_db().unwrap();
        let state = build_state(&db_path);
        state.ledger.insert_location("SHELF", Some(STOCK), false).unwrap();
        state.ledger.set_on_hand("P1", "SHELF", dec!(5)).unwrap();

        let mut shelf_line = line("S-L1", "S", "P1", dec!(5));
        shelf_line.source_location_id = "SHELF".to_string();
        shelf_line.priority = 1;
        seed_transfer(&db_path, &transfer("S"), &[shelf_line]);
        seed_simple(&db_path, "W", "P1", dec!(5));

        let ctx = state.context("operator", test_now());
        // 父库位 WH 的需求排在 SHELF 高优先级需求之后
        let report = state
            .release_api
            .release_transfers(&ctx, &["W".to_string()])
            .unwrap();
        assert_eq!(report.released_count, 0);

        let report = state
            .release_api
            .release_transfers(&ctx, &["S".to_string()])
            .unwrap();
        assert_eq!(report.released_count, 1);
    }
}

// ==========================================
// 通道生命周期集成测试
// ==========================================
// 职责: 验证通道状态机、休眠延后、备货计划启动与事件发布
// ==========================================


#[cfg(test)]
mod channel_lifecycle_test {
    use chrono::NaiveDate;
    use outbound_release::api::ApiError;
    use outbound_release::app::AppState;
    use outbound_release::config::config_keys;
    use outbound_release::domain::types::{BatchMode, ChannelState, SkipReason};
    use outbound_release::engine::assignor::AssignmentOutcome;
    use outbound_release::engine::driver::PassOptions;
    use outbound_release::engine::events::{ReleaseEvent, ReleaseEventPublisher};
    use rust_decimal_macros::dec;
    use std::error::Error;
    use std::sync::{Arc, Mutex};

    use crate::test_helpers::*;

    /// 记录所有事件的发布者
    #[derive(Default)]
    struct RecordingPublisher {
        events: Mutex<Vec<ReleaseEvent>>,
    }

    impl ReleaseEventPublisher for RecordingPublisher {
        fn publish(&self, event: ReleaseEvent) -> Result<String, Box<dyn Error + Send + Sync>> {
            self.events.lock().unwrap().push(event);
            Ok(String::new())
        }
    }

    impl RecordingPublisher {
        fn kinds(&self) -> Vec<&'static str> {
            self.events.lock().unwrap().iter().map(|e| e.as_str()).collect()
        }
    }

    #[tokio::test]
    async fn test_full_lifecycle_with_events() {
        let (_file, db_path) = create_test_db().unwrap();
        let publisher = Arc::new(RecordingPublisher::default());
        let state = AppState::with_publisher(db_path.clone(), publisher.clone())
            .await
            .unwrap();
        let ctx = state.context("planner", test_now());

        let created = state
            .channel_api
            .create_channel(&ctx, channel("", 5, BatchMode::Automatic, ChannelState::Open))
            .unwrap();
        // 新通道始终为草稿
        assert_eq!(created.state, ChannelState::Draft);
        let id = created.channel_id.clone();
        assert!(!id.is_empty());

        assert_eq!(state.channel_api.activate(&ctx, &id).unwrap().channel.state, ChannelState::Open);
        assert_eq!(state.channel_api.lock(&ctx, &id).unwrap().channel.state, ChannelState::Locked);
        assert_eq!(state.channel_api.unlock(&ctx, &id).unwrap().channel.state, ChannelState::Open);
        assert_eq!(
            state.channel_api.sleep(&ctx, &id, false).unwrap().channel.state,
            ChannelState::Asleep
        );

        let later = test_now() + chrono::Duration::days(1);
        let woken = state
            .channel_api
            .wake(&state.context("planner", later), &id)
            .unwrap();
        assert_eq!(woken.from, ChannelState::Asleep);
        assert_eq!(woken.channel.last_wake_date, Some(later.date()));

        assert_eq!(count_actions(&db_path, "CHANNEL_TRANSITION"), 5);
        assert_eq!(
            publisher.kinds(),
            vec!["ChannelStateChanged"; 5],
            "每次状态变更发布一条事件"
        );
    }

    #[test]
    fn test_invalid_transitions_are_rejected() {
        let (_file, db_path) = create_test_db().unwrap();
        seed_channel(&db_path, &channel("C1", 1, BatchMode::Manual, ChannelState::Draft));
        seed_channel(&db_path, &channel("C2", 2, BatchMode::Manual, ChannelState::Locked));

        let state = build_state(&db_path);
        let ctx = state.context("planner", test_now());

        // draft 不能直接休眠或锁定
        let err = state.channel_api.sleep(&ctx, "C1", false).unwrap_err();
        assert!(matches!(err, ApiError::InvalidStateTransition { .. }));
        assert!(state.channel_api.lock(&ctx, "C1").is_err());

        // 锁定通道不能用 wake/activate 打开, 只能 unlock
        assert!(state.channel_api.wake(&ctx, "C2").is_err());
        assert!(state.channel_api.activate(&ctx, "C2").is_err());
        assert!(state.channel_api.unlock(&ctx, "C2").is_ok());

        let err = state.channel_api.activate(&ctx, "missing").unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
        assert_eq!(count_actions(&db_path, "CHANNEL_TRANSITION"), 1);
    }

    // ==========================================
    // 休眠: 有待释放工作时拒绝, 或延后 (解除分配)
    // ==========================================
    #[test]
    fn test_sleep_with_pending_work() {
        let (_file, db_path) = create_test_db().unwrap();
        seed_channel(&db_path, &channel("C1", 1, BatchMode::Manual, ChannelState::Open));
        let mut t = transfer("T1");
        t.release_channel_id = Some("C1".to_string());
        seed_transfer(&db_path, &t, &[line("T1-L1", "T1", "P1", dec!(2))]);

        let state = build_state(&db_path);
        let ctx = state.context("planner", test_now());

        let err = state.channel_api.sleep(&ctx, "C1", false).unwrap_err();
        assert_eq!(err.reason_code(), "pending_work");
        assert_eq!(state.channel_api.get_channel("C1").unwrap().state, ChannelState::Open);

        let outcome = state.channel_api.sleep(&ctx, "C1", true).unwrap();
        assert_eq!(outcome.unassigned_transfer_ids, vec!["T1".to_string()]);
        assert_eq!(outcome.channel.state, ChannelState::Asleep);
        assert!(load_transfer(&db_path, "T1").release_channel_id.is_none());
    }

    // ==========================================
    // 部分释放后被延后的调拨单: 下一轮重新分配
    // ==========================================
    #[test]
    fn test_deferred_mid_release_transfer_is_reassigned() {
        let (_file, db_path) = create_test_db().unwrap();
        seed_channel(&db_path, &channel("C1", 1, BatchMode::Manual, ChannelState::Open));
        let mut t = transfer("T1");
        t.release_channel_id = Some("C1".to_string());
        seed_transfer(
            &db_path,
            &t,
            &[
                line("T1-L1", "T1", "P1", dec!(2)),
                line("T1-L2", "T1", "P2", dec!(2)),
            ],
        );
        set_on_hand(&db_path, "P1", dec!(2));

        let state = build_state(&db_path);
        let ctx = state.context("planner", test_now());
        state
            .release_api
            .release_lines(&ctx, &["T1-L1".to_string()])
            .unwrap();
        assert!(load_transfer(&db_path, "T1").is_mid_release());

        let outcome = state.channel_api.sleep(&ctx, "C1", true).unwrap();
        assert_eq!(outcome.unassigned_transfer_ids, vec!["T1".to_string()]);

        seed_channel(&db_path, &channel("C2", 2, BatchMode::Automatic, ChannelState::Open));
        let report = state.driver.run_pass(&ctx, &PassOptions::scheduled()).unwrap();
        assert_eq!(
            report.assignments,
            vec![(
                "T1".to_string(),
                AssignmentOutcome::Assigned {
                    channel_id: "C2".to_string(),
                    previous: None,
                }
            )]
        );
        assert_eq!(load_transfer(&db_path, "T1").release_channel_id.as_deref(), Some("C2"));
        assert!(load_line(&db_path, "T1-L2").needs_release);

        // 到货后剩余行由新通道释放
        set_on_hand(&db_path, "P2", dec!(2));
        state.driver.run_pass(&ctx, &PassOptions::scheduled()).unwrap();
        assert!(!load_line(&db_path, "T1-L2").needs_release);
    }

    // ==========================================
    // 休眠通道不释放
    // ==========================================
    #[test]
    fn test_asleep_channel_does_not_release() {
        let (_file, db_path) = create_test_db().unwrap();
        seed_channel(&db_path, &channel("C1", 1, BatchMode::Manual, ChannelState::Asleep));
        let mut t = transfer("T1");
        t.release_channel_id = Some("C1".to_string());
        seed_transfer(&db_path, &t, &[line("T1-L1", "T1", "P1", dec!(2))]);
        set_on_hand(&db_path, "P1", dec!(2));

        let state = build_state(&db_path);
        let ctx = state.context("operator", test_now());
        let report = state
            .release_api
            .release_transfers(&ctx, &["T1".to_string()])
            .unwrap();
        assert_eq!(report.released_count, 0);
        assert_eq!(report.lines[0].skip, Some(SkipReason::ChannelNotReleasable));
    }

    // ==========================================
    // 备货计划启动
    // ==========================================
    #[test]
    fn test_launch_plan_wakes_plan_channels() {
        let (_file, db_path) = create_test_db().unwrap();
        let state = build_state(&db_path);
        let ctx = state.context("planner", test_now());
        let plan = state.channel_api.create_plan(&ctx, "早班备货").unwrap();

        let mut a = channel("A", 1, BatchMode::Automatic, ChannelState::Asleep);
        a.preparation_plan_id = Some(plan.plan_id.clone());
        let mut b = channel("B", 2, BatchMode::Automatic, ChannelState::Asleep);
        b.preparation_plan_id = Some(plan.plan_id.clone());
        b.exclude_public_holidays = true;
        let mut c = channel("C", 3, BatchMode::Automatic, ChannelState::Open);
        c.preparation_plan_id = Some(plan.plan_id.clone());
        let other = channel("OTHER", 4, BatchMode::Automatic, ChannelState::Asleep);
        for ch in [&a, &b, &c, &other] {
            seed_channel(&db_path, ch);
        }

        let holiday = NaiveDate::from_ymd_opt(2026, 5, 1).unwrap();
        state.channel_api.add_holiday(holiday, Some("劳动节")).unwrap();

        let report = state.channel_api.launch_plan(&ctx, &plan.plan_id, holiday).unwrap();
        assert_eq!(report.woken, vec!["A".to_string()]);
        assert_eq!(report.skipped_holiday, vec!["B".to_string()]);
        assert_eq!(report.not_asleep, vec!["C".to_string()]);
        assert_eq!(state.channel_api.get_channel("OTHER").unwrap().state, ChannelState::Asleep);

        let workday = NaiveDate::from_ymd_opt(2026, 5, 4).unwrap();
        state
            .config_manager
            .set_global_value(config_keys::MAX_PREPARATION_LEAD_TIME_MINUTES, "45")
            .unwrap();
        let report = state.channel_api.launch_plan(&ctx, &plan.plan_id, workday).unwrap();
        assert_eq!(report.woken, vec!["B".to_string()]);

        // 审计载荷带当次配置快照
        let latest = state.action_log_repo.find_recent(1).unwrap();
        assert_eq!(latest[0].action_type, "LAUNCH_PLAN");
        let payload = latest[0].payload_json.clone().unwrap();
        assert_eq!(payload["config"][config_keys::MAX_PREPARATION_LEAD_TIME_MINUTES], "45");

        let stored = state.plan_repo.find_by_id(&plan.plan_id).unwrap().unwrap();
        assert_eq!(stored.last_launch_date, Some(workday));
        assert_eq!(count_actions(&db_path, "LAUNCH_PLAN"), 2);

        let err = state.channel_api.launch_plan(&ctx, "missing", workday).unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[test]
    fn test_create_channel_validation() {
        let (_file, db_path) = create_test_db().unwrap();
        let state = build_state(&db_path);
        let ctx = state.context("planner", test_now());

        let mut bad_day = channel("C1", 1, BatchMode::Manual, ChannelState::Draft);
        bad_day.delivery_weekdays = vec![8];
        assert!(matches!(
            state.channel_api.create_channel(&ctx, bad_day),
            Err(ApiError::InvalidInput(_))
        ));

        let mut unknown_plan = channel("C1", 1, BatchMode::Manual, ChannelState::Draft);
        unknown_plan.preparation_plan_id = Some("nope".to_string());
        assert!(matches!(
            state.channel_api.create_channel(&ctx, unknown_plan),
            Err(ApiError::NotFound(_))
        ));

        assert!(state.channel_api.create_plan(&ctx, "  ").is_err());
        assert!(state.channel_api.list_channels().unwrap().is_empty());
    }
}

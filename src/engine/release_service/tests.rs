use super::*;
use crate::domain::demand_line::DemandLine;
use crate::domain::transfer::Transfer;
use crate::domain::types::{LineState, ShippingPolicy};
use crate::repository::demand_line_repo::DemandLineRepository;
use crate::repository::ledger_repo::SqliteQuantityLedger;
use crate::repository::schema::ensure_schema;
use crate::repository::transfer_repo::TransferRepository;
use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal_macros::dec;
use tempfile::NamedTempFile;

fn now() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 4, 7)
        .unwrap()
        .and_hms_opt(9, 0, 0)
        .unwrap()
}

struct Fixture {
    _file: NamedTempFile,
    db_path: String,
    service: ReleaseService,
    locks: Arc<TransferLockRepository>,
    ledger: Arc<SqliteQuantityLedger>,
}

fn fixture() -> Fixture {
    let file = NamedTempFile::new().unwrap();
    let db_path = file.path().to_str().unwrap().to_string();
    let conn = crate::db::open_shared_connection(&db_path).unwrap();
    ensure_schema(&conn.lock().unwrap()).unwrap();

    let locks = Arc::new(TransferLockRepository::new(&db_path, 60).unwrap());
    let ledger = Arc::new(SqliteQuantityLedger::new(&db_path).unwrap());
    ledger.insert_location("WH", None, false).unwrap();

    let service = ReleaseService::new(conn, locks.clone(), ledger.clone(), &ReleaseConfig::default());
    Fixture {
        _file: file,
        db_path,
        service,
        locks,
        ledger,
    }
}

fn seed(fx: &Fixture, transfer_id: &str, requested: Decimal, policy: ShippingPolicy) {
    let conn = crate::db::open_sqlite_connection(&fx.db_path).unwrap();
    TransferRepository::insert_with(
        &conn,
        &Transfer {
            transfer_id: transfer_id.to_string(),
            name: format!("OUT/{}", transfer_id),
            partner_id: None,
            commercial_partner_id: None,
            carrier_id: None,
            warehouse_id: None,
            delivery_lat: None,
            delivery_lon: None,
            shipping_policy: policy,
            scheduled_date: now(),
            commitment_date: None,
            release_channel_id: None,
            last_release_date: None,
            confirmed_at: now(),
            needs_release: true,
            is_closed: false,
            backorder_of: None,
        },
    )
    .unwrap();
    DemandLineRepository::insert_with(
        &conn,
        &DemandLine {
            line_id: format!("{}-L1", transfer_id),
            transfer_id: transfer_id.to_string(),
            group_id: None,
            product_id: "P1".to_string(),
            source_location_id: "WH".to_string(),
            dest_location_id: "CUSTOMER".to_string(),
            uom_rounding: dec!(1),
            requested_qty: requested,
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
            priority: 0,
            date_priority: now(),
            is_backorder_of: None,
            revision: 0,
        },
    )
    .unwrap();
}

#[test]
fn test_contended_transfer_is_skipped_not_failed() {
    let fx = fixture();
    seed(&fx, "T1", dec!(5), ShippingPolicy::AsSoonAsPossible);
    fx.ledger.set_on_hand("P1", "WH", dec!(5)).unwrap();

    let _held = fx.locks.try_acquire("T1", "someone-else").unwrap().unwrap();
    let ctx = ReleaseContext::new("scheduler", now());
    let result = fx
        .service
        .release_transfer(&ctx, &ReleaseRequest::lines("T1", vec!["T1-L1".to_string()]))
        .unwrap();

    assert!(result.contended);
    assert_eq!(result.lines[0].skip, Some(SkipReason::LockedByOtherWorker));
    let line = fx.service_line("T1-L1");
    assert!(line.needs_release);
}

#[test]
fn test_require_full_releases_nothing_on_partial() {
    let fx = fixture();
    seed(&fx, "T1", dec!(10), ShippingPolicy::AsSoonAsPossible);
    fx.ledger.set_on_hand("P1", "WH", dec!(4)).unwrap();

    let ctx = ReleaseContext::new("scheduler", now());
    let result = fx
        .service
        .release_transfer(&ctx, &ReleaseRequest::whole("T1").full_only())
        .unwrap();

    assert_eq!(result.decision, ReleaseDecision::ReadyPartial);
    assert_eq!(result.released_count(), 0);
    assert!(result.backorder_transfer_id.is_none());
    assert_eq!(fx.service_line("T1-L1").requested_qty, dec!(10));
}

#[test]
fn test_lease_released_after_unit_of_work() {
    let fx = fixture();
    seed(&fx, "T1", dec!(3), ShippingPolicy::AllAtOnce);
    fx.ledger.set_on_hand("P1", "WH", dec!(3)).unwrap();

    let ctx = ReleaseContext::new("operator", now());
    let result = fx.service.release_transfer(&ctx, &ReleaseRequest::whole("T1")).unwrap();
    assert_eq!(result.released_count(), 1);
    assert!(fx.locks.find_lease("T1").unwrap().is_none());
}

#[test]
fn test_unknown_transfer_is_not_found() {
    let fx = fixture();
    let ctx = ReleaseContext::new("operator", now());
    let err = fx
        .service
        .release_transfer(&ctx, &ReleaseRequest::whole("missing"))
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
    assert!(fx.locks.find_lease("missing").unwrap().is_none());
}

impl Fixture {
    fn service_line(&self, line_id: &str) -> DemandLine {
        let conn = crate::db::open_sqlite_connection(&self.db_path).unwrap();
        DemandLineRepository::find_by_id_with(&conn, line_id).unwrap().unwrap()
    }
}

// ==========================================
// 扩展点: 自定义决策规则与通道谓词
// ==========================================

fn service_with(fx: &Fixture, customize: impl FnOnce(ReleaseService) -> ReleaseService) -> ReleaseService {
    let conn = crate::db::open_shared_connection(&fx.db_path).unwrap();
    customize(ReleaseService::new(
        conn,
        fx.locks.clone(),
        fx.ledger.clone(),
        &ReleaseConfig::default(),
    ))
}

#[test]
fn test_custom_transfer_rule_holds_release() {
    use crate::engine::decision::{LineVerdict, TransferRule};

    /// 冻结的调拨单一律不释放
    struct FrozenTransferRule;
    impl TransferRule for FrozenTransferRule {
        fn name(&self) -> &'static str {
            "frozen"
        }
        fn apply(&self, transfer: &Transfer, _lines: &[DemandLine], verdicts: &mut [LineVerdict]) {
            if !transfer.name.starts_with("OUT/FROZEN") {
                return;
            }
            for v in verdicts.iter_mut().filter(|v| v.is_candidate()) {
                v.decision = ReleaseDecision::Blocked;
                v.release_qty = Decimal::ZERO;
                v.reason = "frozen".to_string();
            }
        }
    }

    let fx = fixture();
    seed(&fx, "FROZEN-1", dec!(2), ShippingPolicy::AsSoonAsPossible);
    seed(&fx, "T2", dec!(2), ShippingPolicy::AsSoonAsPossible);
    fx.ledger.set_on_hand("P1", "WH", dec!(4)).unwrap();

    let service = service_with(&fx, |s| {
        s.with_decision_engine(DecisionEngine::new().with_transfer_rule(Box::new(FrozenTransferRule)))
    });
    let ctx = ReleaseContext::new("operator", now());

    let frozen = service.release_transfer(&ctx, &ReleaseRequest::whole("FROZEN-1")).unwrap();
    assert_eq!(frozen.decision, ReleaseDecision::Blocked);
    assert_eq!(frozen.lines[0].skip, Some(SkipReason::Blocked));

    let normal = service.release_transfer(&ctx, &ReleaseRequest::whole("T2")).unwrap();
    assert_eq!(normal.released_count(), 1);
}

#[test]
fn test_custom_channel_predicate_filters_channels() {
    use crate::domain::channel::{HolidayCalendar, ReleaseChannel};
    use crate::domain::types::{BatchMode, ChannelState};
    use crate::engine::assignor::ChannelPredicate;
    use crate::repository::channel_repo::ChannelRepository;

    /// 名称以 COLD 开头的通道只接收冷链调拨单
    struct ColdChainPredicate;
    impl ChannelPredicate for ColdChainPredicate {
        fn name(&self) -> &'static str {
            "cold_chain"
        }
        fn is_set(&self, channel: &ReleaseChannel) -> bool {
            channel.name.starts_with("COLD")
        }
        fn accepts(&self, _channel: &ReleaseChannel, transfer: &Transfer, _holidays: &HolidayCalendar) -> bool {
            transfer.transfer_id.starts_with("COLD")
        }
    }

    let fx = fixture();
    seed(&fx, "T1", dec!(1), ShippingPolicy::AsSoonAsPossible);
    seed(&fx, "COLD-1", dec!(1), ShippingPolicy::AsSoonAsPossible);
    let conn = crate::db::open_sqlite_connection(&fx.db_path).unwrap();
    for (id, name, sequence) in [("C-COLD", "COLD dock", 1), ("C-DRY", "dry dock", 2)] {
        ChannelRepository::insert_with(
            &conn,
            &ReleaseChannel {
                channel_id: id.to_string(),
                name: name.to_string(),
                sequence,
                state: ChannelState::Open,
                batch_mode: BatchMode::Manual,
                partner_ids: vec![],
                carrier_ids: vec![],
                delivery_weekdays: vec![],
                geo_zone: None,
                warehouse_id: None,
                exclude_public_holidays: false,
                preparation_plan_id: None,
                last_wake_date: None,
                updated_at: now(),
            },
        )
        .unwrap();
    }

    let service = service_with(&fx, |s| {
        s.with_assignor(ChannelAssignor::new().with_predicate(Box::new(ColdChainPredicate)))
    });
    let ctx = ReleaseContext::new("operator", now());

    let dry = service.assign_transfer(&ctx, "T1", false, None).unwrap().unwrap();
    assert_eq!(dry.channel_id(), Some("C-DRY"));
    let cold = service.assign_transfer(&ctx, "COLD-1", false, None).unwrap().unwrap();
    assert_eq!(cold.channel_id(), Some("C-COLD"));
}

//! Pairing behavior through the station facade

mod helpers;

use chrono::Duration;
use helpers::*;
use linecount_station::{CompletionKind, PlanStatus, ScanFormat, ScanOutcome};
use std::sync::{Arc, Mutex};

#[tokio::test]
async fn test_qr_then_barcode_completes_one_unit() {
    let station = Station::with_plans(&[plan(1, "P001", 1, PlanStatus::Planned, 0, 10)]).await;

    let first = station.scan(&qr("QR-0001", "P001", "LOT1")).await;
    assert_eq!(first, ScanOutcome::AwaitingPair { expected: ScanFormat::Barcode });

    station.clock.advance(Duration::seconds(2));
    let second = station.scan(&barcode("BC-0001", "P001", "LOT1")).await;
    assert!(matches!(second, ScanOutcome::Paired { .. }));

    assert_eq!(station.produced_today("P001").await, 1);
    assert!(station.service.pending_staging_status().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_same_qr_twice_is_ignored() {
    let station = Station::with_plans(&[plan(1, "P001", 1, PlanStatus::Planned, 0, 10)]).await;

    station.scan(&qr("QR-0001", "P001", "LOT1")).await;
    let again = station.scan(&qr("QR-0001", "P001", "LOT1")).await;
    assert_eq!(again, ScanOutcome::DuplicateIgnored);

    station.scan(&barcode("BC-0001", "P001", "LOT1")).await;
    let after_pair = station.scan(&qr("QR-0001", "P001", "LOT1")).await;
    assert_eq!(after_pair, ScanOutcome::DuplicateIgnored);

    assert_eq!(station.produced_today("P001").await, 1);
}

#[tokio::test]
async fn test_barcode_first_pairs_in_either_order() {
    let station = Station::build(&[], |c| c.lifecycle.require_plan = false).await;

    station.scan(&barcode("BC-1", "P001", "LOT1")).await;
    let outcome = station.scan(&qr("QR-1", "P001", "LOT1")).await;
    assert!(matches!(outcome, ScanOutcome::Paired { .. }));
    assert_eq!(station.produced_today("P001").await, 1);
}

#[tokio::test]
async fn test_stale_half_never_blocks_a_new_pair() {
    let station = Station::build(&[], |c| c.lifecycle.require_plan = false).await;

    station.scan(&qr("QR-OLD", "P001", "LOT1")).await;
    station.clock.advance(Duration::seconds(35));

    let fresh = station.scan(&qr("QR-NEW", "P001", "LOT1")).await;
    assert_eq!(fresh, ScanOutcome::AwaitingPair { expected: ScanFormat::Barcode });

    let paired = station.scan(&barcode("BC-NEW", "P001", "LOT1")).await;
    assert!(matches!(paired, ScanOutcome::Paired { .. }));
    assert_eq!(station.produced_today("P001").await, 1);
    assert!(station.service.pending_staging_status().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unplanned_part_is_rejected_when_plans_are_required() {
    let station = Station::with_plans(&[plan(1, "P001", 1, PlanStatus::Planned, 0, 10)]).await;

    let outcome = station.scan(&qr("QR-1", "P999", "LOT1")).await;
    assert_eq!(outcome, ScanOutcome::OutOfPlan);
    assert!(station.service.pending_staging_status().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_lower_open_plan_for_another_part_blocks() {
    let station = Station::with_plans(&[
        plan(1, "P001", 1, PlanStatus::Active, 3, 10),
        plan(2, "P002", 2, PlanStatus::Planned, 0, 10),
    ])
    .await;

    let outcome = station.scan(&qr("QR-1", "P002", "LOT1")).await;
    assert_eq!(
        outcome,
        ScanOutcome::ModelMismatch {
            active_part_no: "P001".into()
        }
    );
}

#[tokio::test]
async fn test_cross_reference_pairs_main_with_sub_assembly() {
    let station = Station::build(&[], |c| {
        c.lifecycle.require_plan = false;
        c.pairing.cross_ref_mode = true;
    })
    .await;
    station.remote.inner().put_cross_ref("MAIN1", "SUB1").await.unwrap();
    station.service.coordinator().pull_plans().await.unwrap();

    let sub = station.scan(&qr("QR-SUB", "SUB1", "")).await;
    assert_eq!(sub, ScanOutcome::AwaitingPair { expected: ScanFormat::Barcode });
    let main = station.scan(&barcode("BC-MAIN", "MAIN1", "")).await;
    assert!(matches!(main, ScanOutcome::Paired { .. }));
    assert_eq!(station.produced_today("MAIN1").await, 1);

    station.scan(&qr("QR-WRONG", "SUB9", "")).await;
    let mismatch = station.scan(&barcode("BC-MAIN-2", "MAIN1", "")).await;
    assert_eq!(mismatch, ScanOutcome::CrossRefMismatch);
    assert!(station.service.pending_staging_status().await.unwrap().is_empty());
    assert_eq!(station.produced_today("MAIN1").await, 1);
}

#[tokio::test]
async fn test_solo_mode_counts_every_scan() {
    let station = Station::build(&[], |c| {
        c.lifecycle.require_plan = false;
        c.pairing.solo_mode = true;
    })
    .await;

    for i in 0..3 {
        let outcome = station.scan(&qr(&format!("QR-{}", i), "P001", "LOT1")).await;
        assert!(matches!(outcome, ScanOutcome::Paired { .. }));
    }
    assert_eq!(station.produced_today("P001").await, 3);
}

#[tokio::test]
async fn test_unreadable_scan_reports_error() {
    let station = Station::with_plans(&[]).await;
    let outcome = station.scan("not a scan").await;
    assert!(matches!(outcome, ScanOutcome::Error { .. }));
    assert_eq!(outcome.reason_code(), "ERROR");
}

#[tokio::test]
async fn test_completion_listener_sees_each_step() {
    let station = Station::build(&[], |c| c.lifecycle.require_plan = false).await;
    let seen: Arc<Mutex<Vec<(String, String, CompletionKind)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _listener = station.service.register_completion_listener(move |line, part, kind| {
        sink.lock().unwrap().push((line.to_string(), part.to_string(), kind));
    });

    station.scan(&qr("QR-1", "P001", "LOT1")).await;
    station.scan(&qr("QR-1", "P001", "LOT1")).await;
    station.scan(&barcode("BC-1", "P001", "LOT1")).await;

    for _ in 0..50 {
        if seen.lock().unwrap().len() >= 3 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    let kinds: Vec<CompletionKind> = seen.lock().unwrap().iter().map(|(_, _, k)| *k).collect();
    assert_eq!(
        kinds,
        vec![CompletionKind::HalfStaged, CompletionKind::Rejected, CompletionKind::UnitCompleted]
    );
    assert!(seen.lock().unwrap().iter().all(|(line, part, _)| line == LINE && part == "P001"));
}

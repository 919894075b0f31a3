//! Work-order lifecycle through the station facade

mod helpers;

use helpers::*;
use linecount_station::{PlanStatus, ScanOutcome};

async fn pair(station: &Station, n: usize, part: &str) {
    let outcome = station.scan(&qr(&format!("Q-{}-{}", part, n), part, "LOT1")).await;
    assert!(outcome.is_accepted(), "qr {} rejected: {:?}", n, outcome);
    let outcome = station.scan(&barcode(&format!("B-{}-{}", part, n), part, "LOT1")).await;
    assert!(matches!(outcome, ScanOutcome::Paired { .. }), "pair {} not completed: {:?}", n, outcome);
}

#[tokio::test]
async fn test_first_pair_activates_planned_plan() {
    let station = Station::with_plans(&[plan(1, "P001", 1, PlanStatus::Planned, 0, 10)]).await;
    assert_eq!(station.local_plan(1).status, PlanStatus::Planned);

    pair(&station, 1, "P001").await;

    let plan = station.local_plan(1);
    assert_eq!(plan.status, PlanStatus::Active);
    assert_eq!(plan.produced_count, 1);
    assert!(plan.started_at.is_some());
}

#[tokio::test]
async fn test_full_plan_rejects_without_counting() {
    let station = Station::with_plans(&[plan(1, "P001", 1, PlanStatus::Active, 5, 5)]).await;

    let outcome = station.scan(&qr("QR-X", "P001", "LOT1")).await;
    assert_eq!(outcome, ScanOutcome::PlanComplete);
    assert_eq!(outcome.reason_code(), "PLAN_COMPLETE");

    assert_eq!(station.produced_today("P001").await, 0);
    assert_eq!(station.local_plan(1).produced_count, 5);
    assert!(station.service.pending_staging_status().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_lowest_sequence_plan_is_activated_first() {
    let station = Station::with_plans(&[
        plan(11, "P001", 2, PlanStatus::Planned, 0, 10),
        plan(10, "P001", 1, PlanStatus::Planned, 0, 10),
    ])
    .await;

    pair(&station, 1, "P001").await;

    assert_eq!(station.local_plan(10).status, PlanStatus::Active);
    assert_eq!(station.local_plan(10).produced_count, 1);
    assert_eq!(station.local_plan(11).status, PlanStatus::Planned);
    assert_eq!(station.local_plan(11).produced_count, 0);
}

#[tokio::test]
async fn test_produced_count_never_goes_backwards_on_pull() {
    let station = Station::with_plans(&[plan(1, "P001", 1, PlanStatus::Planned, 0, 10)]).await;
    pair(&station, 1, "P001").await;
    pair(&station, 2, "P001").await;
    assert_eq!(station.local_plan(1).produced_count, 2);

    // Remote still reports zero: increments are pending
    station.service.coordinator().pull_plans().await.unwrap();
    assert_eq!(station.local_plan(1).produced_count, 2);

    assert_eq!(station.service.coordinator().push_increments().await.unwrap(), 2);
    assert_eq!(station.remote.plan_produced(1).await, 2);

    station.service.coordinator().pull_plans().await.unwrap();
    assert_eq!(station.local_plan(1).produced_count, 2);
}

#[tokio::test]
async fn test_remote_count_ahead_is_adopted() {
    let station = Station::with_plans(&[plan(1, "P001", 1, PlanStatus::Active, 2, 10)]).await;

    // Another station counted on the same plan
    station
        .remote
        .inner()
        .upsert_plan(&plan(1, "P001", 1, PlanStatus::Active, 7, 10))
        .await
        .unwrap();
    station.service.coordinator().pull_plans().await.unwrap();

    assert_eq!(station.local_plan(1).produced_count, 7);
}

#[tokio::test]
async fn test_operator_status_reaches_remote() {
    let station = Station::with_plans(&[plan(1, "P001", 1, PlanStatus::Planned, 0, 10)]).await;

    station.service.set_plan_status(1, PlanStatus::Active).await.unwrap();
    station.service.coordinator().pull_plans().await.unwrap();
    assert_eq!(station.remote.plan_status_label(1).await, "EN PROGRESO");
    assert_eq!(station.local_plan(1).status, PlanStatus::Active);

    station.service.set_plan_status(1, PlanStatus::Paused).await.unwrap();
    station.service.coordinator().pull_plans().await.unwrap();
    assert_eq!(station.remote.plan_status_label(1).await, "PAUSADO");
    assert_eq!(station.local_plan(1).status, PlanStatus::Paused);
}

#[tokio::test]
async fn test_invalid_transition_is_refused() {
    let station = Station::with_plans(&[plan(1, "P001", 1, PlanStatus::Planned, 0, 10)]).await;

    station.service.set_plan_status(1, PlanStatus::Closed).await.unwrap();
    assert!(station.service.set_plan_status(1, PlanStatus::Active).await.is_err());
    assert_eq!(station.local_plan(1).status, PlanStatus::Closed);
}

#[tokio::test]
async fn test_pull_leaves_at_most_one_active_plan() {
    let station = Station::with_plans(&[
        plan(1, "P001", 1, PlanStatus::Active, 0, 10),
        plan(2, "P002", 2, PlanStatus::Active, 0, 10),
    ])
    .await;

    let active: Vec<i64> = station
        .service
        .plan_for_line(LINE)
        .iter()
        .filter(|p| p.status == PlanStatus::Active)
        .map(|p| p.id)
        .collect();
    assert_eq!(active.len(), 1);
}

#[tokio::test]
async fn test_line_metrics_roll_up_daily_totals() {
    let station = Station::build(&[plan(1, "P001", 1, PlanStatus::Planned, 0, 10)], |c| {
        c.lifecycle.headcount.insert(LINE.to_string(), 2);
    })
    .await;
    for n in 0..4 {
        pair(&station, n, "P001").await;
    }

    let metrics = station.service.line_metrics(LINE).await.unwrap();
    assert_eq!(metrics.planned, 10);
    assert_eq!(metrics.produced, 4);
    assert_eq!(metrics.rate, 4);
    assert_eq!(metrics.headcount, 2);
    assert!((metrics.efficiency_pct - 40.0).abs() < f64::EPSILON);
    assert!((metrics.units_per_person_hour - 2.0).abs() < f64::EPSILON);
}

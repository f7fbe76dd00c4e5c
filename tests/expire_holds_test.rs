mod common;

use axum::http::{Method, StatusCode};
use staykit_api::adapters::pms::PmsApi;

use common::{response_json, TestApp, JOB_TOKEN};

fn auth() -> (String, String) {
    ("Authorization".to_string(), format!("Bearer {}", JOB_TOKEN))
}

#[tokio::test]
async fn job_endpoints_demand_the_service_token() {
    let app = TestApp::new();

    let unauthorized = app
        .request(Method::POST, "/jobs/expire-holds", None, &[])
        .await;
    assert_eq!(unauthorized.status(), StatusCode::UNAUTHORIZED);

    let wrong = app
        .request(
            Method::POST,
            "/jobs/expire-holds",
            None,
            &[("Authorization", "Bearer nope")],
        )
        .await;
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn sweep_releases_stale_holds_and_counts_them() {
    let app = TestApp::with_hold_ttl_minutes(-1);
    let first = app.checkout_with_hold("K1").await;
    let second = app.checkout_with_hold("K2").await;

    let (name, value) = auth();
    let sweep = app
        .request(Method::POST, "/jobs/expire-holds", None, &[(&name, &value)])
        .await;
    assert_eq!(sweep.status(), StatusCode::OK);
    let report = response_json(sweep).await;
    assert_eq!(report["expiredCount"], 2);
    assert_eq!(report["errorCount"], 0);

    // every released hold had its PMS reservation canceled
    let mut canceled = app.pms.cancel_calls();
    canceled.sort();
    assert_eq!(canceled, vec!["R1".to_string(), "R2".to_string()]);

    for id in [&first, &second] {
        let checkout = response_json(
            app.request(Method::GET, &format!("/checkout/{}", id), None, &[])
                .await,
        )
        .await;
        assert_eq!(checkout["state"], "EXPIRED");
        let last = checkout["stateHistory"].as_array().unwrap().last().unwrap().clone();
        assert_eq!(last["actor"], "system");
        assert_eq!(last["reason"], "Hold TTL exceeded");
    }
}

#[tokio::test]
async fn sweep_skips_live_holds() {
    let app = TestApp::new();
    let id = app.checkout_with_hold("K1").await;

    let (name, value) = auth();
    let sweep = app
        .request(Method::POST, "/jobs/expire-holds", None, &[(&name, &value)])
        .await;
    let report = response_json(sweep).await;
    assert_eq!(report["expiredCount"], 0);

    let checkout = response_json(
        app.request(Method::GET, &format!("/checkout/{}", id), None, &[])
            .await,
    )
    .await;
    assert_eq!(checkout["state"], "HOLD_CREATED");
}

#[tokio::test]
async fn stale_payment_created_checkouts_also_expire() {
    let app = TestApp::with_hold_ttl_minutes(-1);
    let (id, _) = app.checkout_with_intent("stale-intent").await;

    let (name, value) = auth();
    let sweep = app
        .request(Method::POST, "/jobs/expire-holds", None, &[(&name, &value)])
        .await;
    let report = response_json(sweep).await;
    assert_eq!(report["expiredCount"], 1);

    let checkout = response_json(
        app.request(Method::GET, &format!("/checkout/{}", id), None, &[])
            .await,
    )
    .await;
    assert_eq!(checkout["state"], "EXPIRED");
}

#[tokio::test]
async fn reconcile_job_cancels_orphaned_reservations_only() {
    let app = TestApp::new();
    // R1 is a live hold owned by a checkout
    let id = app.checkout_with_hold("K1").await;

    // R2 exists only on the PMS: its hold commit never landed
    let orphan = app
        .pms
        .create_reservation(&staykit_api::adapters::pms::CreateReservation {
            listing_id: "L9".to_string(),
            reservation_type: staykit_api::adapters::pms::ReservationType::Reserved,
            guest: staykit_api::models::Guest {
                first_name: "Ana".to_string(),
                last_name: "Souza".to_string(),
                email: "ana@example.com".to_string(),
                phone: "+5511999990000".to_string(),
                document: None,
            },
            check_in: chrono::Utc::now().date_naive() + chrono::Duration::days(10),
            check_out: chrono::Utc::now().date_naive() + chrono::Duration::days(13),
            guests: staykit_api::models::GuestCount {
                adults: 2,
                children: 0,
                infants: 0,
            },
            total_price: 90_000,
            currency: "BRL".to_string(),
        })
        .await
        .unwrap();
    app.pms
        .backdate_reservation(&orphan.id, chrono::Utc::now() - chrono::Duration::hours(1));

    let (name, value) = auth();
    let reconcile = app
        .request(
            Method::POST,
            "/jobs/reconcile-reservations",
            None,
            &[(&name, &value)],
        )
        .await;
    assert_eq!(reconcile.status(), StatusCode::OK);
    let report = response_json(reconcile).await;
    assert_eq!(report["orphansCanceled"], 1);
    assert_eq!(report["errorCount"], 0);

    // only the orphan was touched; the owned hold is intact
    assert_eq!(app.pms.cancel_calls(), vec![orphan.id.clone()]);
    let checkout = response_json(
        app.request(Method::GET, &format!("/checkout/{}", id), None, &[])
            .await,
    )
    .await;
    assert_eq!(checkout["state"], "HOLD_CREATED");
}

#[tokio::test]
async fn reap_records_reports_dropped_counts() {
    let app = TestApp::new();
    // nothing expired yet
    let (name, value) = auth();
    let reap = app
        .request(Method::POST, "/jobs/reap-records", None, &[(&name, &value)])
        .await;
    assert_eq!(reap.status(), StatusCode::OK);
    let body = response_json(reap).await;
    assert_eq!(body["idempotencyReaped"], 0);
    assert_eq!(body["webhookEventsReaped"], 0);
}

#[tokio::test]
async fn booked_checkouts_never_expire() {
    let app = TestApp::with_hold_ttl_minutes(-1);
    let (id, intent_id) = app.checkout_with_intent("booked").await;

    // payment lands before the sweep
    let event = app.succeeded_event("evt_booked", &id, &intent_id);
    assert_eq!(app.post_webhook(&event).await.status(), StatusCode::OK);

    let (name, value) = auth();
    let sweep = app
        .request(Method::POST, "/jobs/expire-holds", None, &[(&name, &value)])
        .await;
    let report = response_json(sweep).await;
    assert_eq!(report["expiredCount"], 0);

    let checkout = response_json(
        app.request(Method::GET, &format!("/checkout/{}", id), None, &[])
            .await,
    )
    .await;
    assert_eq!(checkout["state"], "BOOKED");
    assert_eq!(checkout["pmsBookingCode"], "B42");
}

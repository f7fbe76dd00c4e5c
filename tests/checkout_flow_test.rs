mod common;

use axum::http::{Method, StatusCode};
use serde_json::json;

use common::{response_json, TestApp};

#[tokio::test]
async fn happy_path_quote_hold_pay_book_finalize() {
    let app = TestApp::new();
    let today = chrono::Utc::now().date_naive();

    // initialize: locked quote in INITIATED
    let init = app
        .request(
            Method::POST,
            "/checkout/initialize",
            Some(json!({
                "listingId": "L1",
                "checkIn": (today + chrono::Duration::days(10)).to_string(),
                "checkOut": (today + chrono::Duration::days(13)).to_string(),
                "guests": {"adults": 2, "children": 1, "infants": 0}
            })),
            &[],
        )
        .await;
    assert_eq!(init.status(), StatusCode::CREATED);
    let checkout = response_json(init).await;
    assert_eq!(checkout["state"], "INITIATED");
    assert_eq!(checkout["quote"]["total"], 120_000);
    assert_eq!(checkout["quote"]["currency"], "BRL");
    let id = checkout["checkoutId"].as_str().unwrap().to_string();

    // guest
    let guest = app
        .request(
            Method::PATCH,
            &format!("/checkout/{}/guest", id),
            Some(json!({
                "firstName": "Ana",
                "lastName": "Souza",
                "email": "ana@example.com",
                "phone": "+5511999990000"
            })),
            &[],
        )
        .await;
    assert_eq!(guest.status(), StatusCode::OK);

    // hold
    let hold = app
        .request(
            Method::POST,
            &format!("/checkout/{}/hold", id),
            None,
            &[("Idempotency-Key", "K1")],
        )
        .await;
    assert_eq!(hold.status(), StatusCode::OK);
    let hold = response_json(hold).await;
    assert_eq!(hold["state"], "HOLD_CREATED");
    assert_eq!(hold["pmsReservationId"], "R1");
    assert!(hold["holdExpiresAt"].is_string());

    // payment intent: secret comes back, never lands in the store
    let intent = app
        .request(
            Method::POST,
            &format!("/checkout/{}/payment-intent", id),
            None,
            &[("Idempotency-Key", "K2")],
        )
        .await;
    assert_eq!(intent.status(), StatusCode::OK);
    let intent = response_json(intent).await;
    assert_eq!(intent["state"], "PAYMENT_CREATED");
    let secret = intent["clientSecret"].as_str().unwrap().to_string();
    assert!(secret.starts_with("cs_"));

    let stored = app
        .request(Method::GET, &format!("/checkout/{}", id), None, &[])
        .await;
    let stored = response_json(stored).await;
    assert!(!stored.to_string().contains(&secret));
    let intent_id = stored["pspPaymentIntentId"].as_str().unwrap().to_string();

    // PSP confirms payment
    let event = app.succeeded_event("evt_1", &id, &intent_id);
    let webhook = app.post_webhook(&event).await;
    assert_eq!(webhook.status(), StatusCode::OK);

    // finalize
    let finalize = app
        .request(
            Method::POST,
            &format!("/checkout/{}/finalize", id),
            Some(json!({"maxWaitMs": 1000})),
            &[],
        )
        .await;
    assert_eq!(finalize.status(), StatusCode::OK);
    let finalize = response_json(finalize).await;
    assert_eq!(finalize["success"], true);
    assert_eq!(finalize["bookingCode"], "B42");
    assert_eq!(finalize["checkout"]["state"], "BOOKED");
    assert!(finalize.get("pending").is_none());
}

#[tokio::test]
async fn cancel_before_payment_blocks_payment_intent() {
    let app = TestApp::new();
    let id = app.checkout_with_hold("K1").await;

    let cancel = app
        .request(
            Method::POST,
            &format!("/checkout/{}/cancel", id),
            Some(json!({"reason": "plans changed"})),
            &[],
        )
        .await;
    assert_eq!(cancel.status(), StatusCode::OK);
    let canceled = response_json(cancel).await;
    assert_eq!(canceled["state"], "CANCELED");
    assert_eq!(app.pms.cancel_calls(), vec!["R1".to_string()]);

    let intent = app
        .request(
            Method::POST,
            &format!("/checkout/{}/payment-intent", id),
            None,
            &[("Idempotency-Key", "K2")],
        )
        .await;
    assert_eq!(intent.status(), StatusCode::CONFLICT);
    let body = response_json(intent).await;
    assert_eq!(body["code"], "INVALID_TRANSITION");
}

#[tokio::test]
async fn past_check_in_fails_validation_on_the_field() {
    let app = TestApp::new();
    let today = chrono::Utc::now().date_naive();

    let init = app
        .request(
            Method::POST,
            "/checkout/initialize",
            Some(json!({
                "listingId": "L1",
                "checkIn": (today - chrono::Duration::days(1)).to_string(),
                "checkOut": (today + chrono::Duration::days(3)).to_string(),
                "guests": {"adults": 2}
            })),
            &[],
        )
        .await;
    assert_eq!(init.status(), StatusCode::BAD_REQUEST);
    let body = response_json(init).await;
    assert_eq!(body["code"], "VALIDATION");
    let message = body["details"]["checkIn"].as_str().unwrap();
    assert!(message.contains("today or later"));
}

#[tokio::test]
async fn unknown_checkout_is_404() {
    let app = TestApp::new();
    let response = app
        .request(
            Method::GET,
            &format!("/checkout/{}", uuid::Uuid::new_v4()),
            None,
            &[],
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = response_json(response).await;
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn finalize_before_payment_reports_pending() {
    let app = TestApp::new();
    let id = app.checkout_with_hold("K1").await;

    let finalize = app
        .request(
            Method::POST,
            &format!("/checkout/{}/finalize", id),
            Some(json!({"maxWaitMs": 10})),
            &[],
        )
        .await;
    let body = response_json(finalize).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["pending"], true);
    assert_eq!(body["checkout"]["state"], "HOLD_CREATED");
}

#[tokio::test]
async fn health_and_openapi_are_served() {
    let app = TestApp::new();

    let health = app.request(Method::GET, "/health", None, &[]).await;
    assert_eq!(health.status(), StatusCode::OK);

    let docs = app
        .request(Method::GET, "/api-docs/openapi.json", None, &[])
        .await;
    assert_eq!(docs.status(), StatusCode::OK);
    let docs = response_json(docs).await;
    assert!(docs["paths"]["/checkout/initialize"].is_object());
}

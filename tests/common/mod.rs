// Shared across the integration suites; not every suite touches every helper.
#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::{self, Body},
    http::{header, Method, Request, StatusCode},
    response::Response,
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use staykit_api::{
    adapters::pms::InMemoryPms,
    adapters::psp::{sign_payload, InMemoryPsp},
    config::{AppConfig, PmsConfig, PspConfig},
    handlers,
    store::MemoryStore,
    AppState,
};

pub const JOB_TOKEN: &str = "test-job-token-123";
pub const WEBHOOK_SECRET: &str = "whsec_test_secret";

/// In-process application over the memory store and in-memory upstreams.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub pms: Arc<InMemoryPms>,
    pub psp: Arc<InMemoryPsp>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_hold_ttl_minutes(15)
    }

    /// A negative TTL makes freshly created holds immediately expirable.
    pub fn with_hold_ttl_minutes(hold_ttl_minutes: i64) -> Self {
        let config = AppConfig {
            database_url: "memory".to_string(),
            host: "127.0.0.1".to_string(),
            port: 0,
            environment: "test".to_string(),
            log_level: "debug".to_string(),
            currency: "BRL".to_string(),
            hold_ttl_minutes,
            quote_ttl_minutes: 30,
            idempotency_ttl_hours: 24,
            webhook_dedup_ttl_days: 7,
            job_auth_token: JOB_TOKEN.to_string(),
            cors_allowed_origins: None,
            auto_migrate: false,
            pms: PmsConfig {
                base_url: "https://pms.test/api".to_string(),
                api_key: "test".to_string(),
                read_timeout_secs: 8,
                write_timeout_secs: 30,
            },
            psp: PspConfig {
                base_url: "https://psp.test/v1".to_string(),
                secret_key: "sk_test".to_string(),
                webhook_secret: WEBHOOK_SECRET.to_string(),
                webhook_tolerance_secs: 300,
                timeout_secs: 15,
            },
        };

        let store = Arc::new(MemoryStore::new());
        let pms = Arc::new(InMemoryPms::new());
        let psp = Arc::new(InMemoryPsp::new("BRL"));

        let state = AppState::build(config, store, pms.clone(), psp.clone());
        let router = handlers::routes(state.clone());

        Self {
            router,
            state,
            pms,
            psp,
        }
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> Response {
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let body = match body {
            Some(value) => Body::from(value.to_string()),
            None => Body::empty(),
        };
        self.router
            .clone()
            .oneshot(builder.body(body).expect("request builds"))
            .await
            .expect("infallible router")
    }

    /// Delivers a signed PSP webhook.
    pub async fn post_webhook(&self, event: &Value) -> Response {
        let raw = serde_json::to_vec(event).expect("event serializes");
        let signature = sign_payload(&raw, WEBHOOK_SECRET, chrono::Utc::now().timestamp());
        let request = Request::builder()
            .method(Method::POST)
            .uri("/webhooks/psp")
            .header(header::CONTENT_TYPE, "application/json")
            .header("psp-signature", signature)
            .body(Body::from(raw))
            .expect("request builds");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible router")
    }

    /// Walks a checkout to HOLD_CREATED and returns its id.
    pub async fn checkout_with_hold(&self, idempotency_key: &str) -> String {
        let today = chrono::Utc::now().date_naive();
        let init = self
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
        let id = checkout["checkoutId"].as_str().unwrap().to_string();

        let guest = self
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

        let hold = self
            .request(
                Method::POST,
                &format!("/checkout/{}/hold", id),
                None,
                &[("Idempotency-Key", idempotency_key)],
            )
            .await;
        assert_eq!(hold.status(), StatusCode::OK);

        id
    }

    /// Walks a checkout through hold and payment intent; returns
    /// `(checkout_id, payment_intent_id)`.
    pub async fn checkout_with_intent(&self, key_prefix: &str) -> (String, String) {
        let id = self.checkout_with_hold(&format!("{}-hold", key_prefix)).await;
        let intent = self
            .request(
                Method::POST,
                &format!("/checkout/{}/payment-intent", id),
                None,
                &[("Idempotency-Key", &format!("{}-intent", key_prefix))],
            )
            .await;
        assert_eq!(intent.status(), StatusCode::OK);

        let checkout = self
            .request(Method::GET, &format!("/checkout/{}", id), None, &[])
            .await;
        let doc = response_json(checkout).await;
        let intent_id = doc["pspPaymentIntentId"].as_str().unwrap().to_string();
        (id, intent_id)
    }

    pub fn succeeded_event(&self, event_id: &str, checkout_id: &str, intent_id: &str) -> Value {
        json!({
            "id": event_id,
            "type": "payment_intent.succeeded",
            "data": {
                "object": {
                    "id": intent_id,
                    "metadata": { "checkoutId": checkout_id }
                }
            }
        })
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}

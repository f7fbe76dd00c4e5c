//! Payment service provider adapter.
//!
//! PaymentIntent create/retrieve plus webhook signature verification. Amounts
//! are integer minor units; this release charges a single configured
//! currency. The client secret is handed back to the caller and must never be
//! persisted.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::config::PspConfig;
use crate::errors::ServiceError;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum PspError {
    #[error("PSP rejected the request ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("webhook signature invalid: {0}")]
    Signature(String),

    #[error("unsupported currency: {0}")]
    UnsupportedCurrency(String),

    #[error("PSP request timed out after {0:?}")]
    Timeout(Duration),

    #[error("PSP transport failure: {0}")]
    Transport(String),
}

impl From<PspError> for ServiceError {
    fn from(err: PspError) -> Self {
        match err {
            PspError::Signature(msg) => ServiceError::PspSignature(msg),
            PspError::UnsupportedCurrency(c) => ServiceError::UnsupportedCurrency(c),
            other => ServiceError::Psp(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentIntent {
    pub amount: i64,
    pub currency: String,
    pub metadata: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntent {
    pub id: String,
    /// Ephemeral credential for the client-side confirmation flow
    pub client_secret: String,
    pub status: String,
    pub amount: i64,
    pub currency: String,
}

/// A verified webhook event
#[derive(Clone, Debug, Deserialize)]
pub struct PspEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
}

impl PspEvent {
    fn object(&self) -> &Value {
        &self.data["object"]
    }

    pub fn payment_intent_id(&self) -> Option<&str> {
        self.object()["id"].as_str()
    }

    pub fn checkout_id(&self) -> Option<Uuid> {
        self.object()["metadata"]["checkoutId"]
            .as_str()
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    pub fn failure_message(&self) -> Option<&str> {
        self.object()["last_payment_error"]["message"].as_str()
    }
}

/// Typed operations against the payment processor
#[async_trait]
pub trait PspApi: Send + Sync {
    async fn create_payment_intent(
        &self,
        req: &CreatePaymentIntent,
    ) -> Result<PaymentIntent, PspError>;

    async fn retrieve_payment_intent(&self, id: &str) -> Result<PaymentIntent, PspError>;
}

/// Verifies a webhook delivery over the exact raw bytes.
///
/// Header format is `t=<unix ts>,v1=<hex hmac>`; the signed payload is
/// `<ts>.<raw body>` keyed with the shared webhook secret.
pub fn verify_webhook(
    raw_body: &[u8],
    signature_header: &str,
    secret: &str,
    tolerance_secs: u64,
) -> Result<PspEvent, PspError> {
    let mut ts = "";
    let mut v1 = "";
    for part in signature_header.split(',') {
        let mut it = part.trim().split('=');
        match (it.next(), it.next()) {
            (Some("t"), Some(val)) => ts = val,
            (Some("v1"), Some(val)) => v1 = val,
            _ => {}
        }
    }
    if ts.is_empty() || v1.is_empty() {
        return Err(PspError::Signature(
            "signature header is missing t= or v1=".to_string(),
        ));
    }

    let ts_i = ts
        .parse::<i64>()
        .map_err(|_| PspError::Signature("timestamp is not an integer".to_string()))?;
    let now = chrono::Utc::now().timestamp();
    if (now - ts_i).unsigned_abs() > tolerance_secs {
        return Err(PspError::Signature("timestamp outside tolerance".to_string()));
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| PspError::Signature("invalid webhook secret".to_string()))?;
    mac.update(ts.as_bytes());
    mac.update(b".");
    mac.update(raw_body);
    let expected = hex::encode(mac.finalize().into_bytes());

    if !constant_time_eq(&expected, v1) {
        return Err(PspError::Signature("digest mismatch".to_string()));
    }

    serde_json::from_slice::<PspEvent>(raw_body)
        .map_err(|e| PspError::Signature(format!("signed payload is not a valid event: {}", e)))
}

/// Computes the signature header for a payload; the test harness builds
/// deliveries with it.
pub fn sign_payload(raw_body: &[u8], secret: &str, ts: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(ts.to_string().as_bytes());
    mac.update(b".");
    mac.update(raw_body);
    format!("t={},v1={}", ts, hex::encode(mac.finalize().into_bytes()))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}

/// reqwest-backed client
pub struct HttpPspClient {
    http: reqwest::Client,
    base_url: String,
    currency: String,
    timeout: Duration,
}

impl HttpPspClient {
    pub fn new(config: &PspConfig, currency: &str) -> Result<Self, ServiceError> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!(
            "Bearer {}",
            config.secret_key
        ))
        .map_err(|e| ServiceError::Internal(format!("invalid PSP secret key: {}", e)))?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| ServiceError::Internal(format!("failed to build PSP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            currency: currency.to_string(),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<PaymentIntent, PspError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.request(method, &url).timeout(self.timeout);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                PspError::Timeout(self.timeout)
            } else {
                PspError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(%status, "PSP call failed");
            return Err(PspError::Api {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<PaymentIntent>()
            .await
            .map_err(|e| PspError::Transport(format!("invalid PSP response body: {}", e)))
    }
}

#[async_trait]
impl PspApi for HttpPspClient {
    async fn create_payment_intent(
        &self,
        req: &CreatePaymentIntent,
    ) -> Result<PaymentIntent, PspError> {
        if !req.currency.eq_ignore_ascii_case(&self.currency) {
            return Err(PspError::UnsupportedCurrency(req.currency.clone()));
        }
        let body = serde_json::to_value(req)
            .map_err(|e| PspError::Transport(format!("failed to encode intent: {}", e)))?;
        self.send(Method::POST, "/payment_intents", Some(&body)).await
    }

    async fn retrieve_payment_intent(&self, id: &str) -> Result<PaymentIntent, PspError> {
        self.send(Method::GET, &format!("/payment_intents/{}", id), None)
            .await
    }
}

#[derive(Debug, Default)]
struct InMemoryPspState {
    intents: HashMap<String, PaymentIntent>,
    next_id: u32,
    fail_create: bool,
}

/// In-memory PSP for tests
#[derive(Debug, Default)]
pub struct InMemoryPsp {
    currency: String,
    state: Mutex<InMemoryPspState>,
}

impl InMemoryPsp {
    pub fn new(currency: &str) -> Self {
        Self {
            currency: currency.to_string(),
            state: Mutex::default(),
        }
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.state.lock().unwrap().fail_create = fail;
    }

    pub fn intent_count(&self) -> usize {
        self.state.lock().unwrap().intents.len()
    }
}

#[async_trait]
impl PspApi for InMemoryPsp {
    async fn create_payment_intent(
        &self,
        req: &CreatePaymentIntent,
    ) -> Result<PaymentIntent, PspError> {
        if !req.currency.eq_ignore_ascii_case(&self.currency) {
            return Err(PspError::UnsupportedCurrency(req.currency.clone()));
        }
        let mut state = self.state.lock().unwrap();
        if state.fail_create {
            return Err(PspError::Api {
                status: 503,
                message: "intent backend unavailable".to_string(),
            });
        }
        state.next_id += 1;
        let intent = PaymentIntent {
            id: format!("pi_{}", state.next_id),
            client_secret: format!("cs_test_{}", state.next_id),
            status: "requires_payment_method".to_string(),
            amount: req.amount,
            currency: req.currency.clone(),
        };
        state.intents.insert(intent.id.clone(), intent.clone());
        Ok(intent)
    }

    async fn retrieve_payment_intent(&self, id: &str) -> Result<PaymentIntent, PspError> {
        self.state
            .lock()
            .unwrap()
            .intents
            .get(id)
            .cloned()
            .ok_or(PspError::Api {
                status: 404,
                message: format!("payment intent {} not found", id),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";

    fn event_body(checkout_id: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "data": {
                "object": {
                    "id": "pi_1",
                    "metadata": { "checkoutId": checkout_id }
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn valid_signature_verifies_and_parses() {
        let checkout_id = Uuid::new_v4();
        let body = event_body(&checkout_id.to_string());
        let header = sign_payload(&body, SECRET, chrono::Utc::now().timestamp());

        let event = verify_webhook(&body, &header, SECRET, 300).unwrap();
        assert_eq!(event.id, "evt_1");
        assert_eq!(event.event_type, "payment_intent.succeeded");
        assert_eq!(event.payment_intent_id(), Some("pi_1"));
        assert_eq!(event.checkout_id(), Some(checkout_id));
    }

    #[test]
    fn tampered_body_is_rejected() {
        let body = event_body(&Uuid::new_v4().to_string());
        let header = sign_payload(&body, SECRET, chrono::Utc::now().timestamp());

        let mut tampered = body.clone();
        tampered[10] ^= 0x01;
        assert!(matches!(
            verify_webhook(&tampered, &header, SECRET, 300),
            Err(PspError::Signature(_))
        ));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let body = event_body(&Uuid::new_v4().to_string());
        let header = sign_payload(&body, "whsec_other", chrono::Utc::now().timestamp());
        assert!(verify_webhook(&body, &header, SECRET, 300).is_err());
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let body = event_body(&Uuid::new_v4().to_string());
        let header = sign_payload(&body, SECRET, chrono::Utc::now().timestamp() - 3600);
        assert!(matches!(
            verify_webhook(&body, &header, SECRET, 300),
            Err(PspError::Signature(_))
        ));
    }

    #[test]
    fn malformed_header_is_rejected() {
        let body = event_body(&Uuid::new_v4().to_string());
        assert!(verify_webhook(&body, "v1=deadbeef", SECRET, 300).is_err());
        assert!(verify_webhook(&body, "", SECRET, 300).is_err());
        assert!(verify_webhook(&body, "t=abc,v1=deadbeef", SECRET, 300).is_err());
    }

    #[tokio::test]
    async fn currency_mismatch_aborts_intent_creation() {
        let psp = InMemoryPsp::new("BRL");
        let err = psp
            .create_payment_intent(&CreatePaymentIntent {
                amount: 120_000,
                currency: "USD".to_string(),
                metadata: HashMap::new(),
                receipt_email: None,
                description: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PspError::UnsupportedCurrency(_)));
    }

    #[test]
    fn failure_message_extraction() {
        let event: PspEvent = serde_json::from_value(serde_json::json!({
            "id": "evt_2",
            "type": "payment_intent.payment_failed",
            "data": {
                "object": {
                    "id": "pi_2",
                    "last_payment_error": { "message": "card_declined" }
                }
            }
        }))
        .unwrap();
        assert_eq!(event.failure_message(), Some("card_declined"));
    }
}

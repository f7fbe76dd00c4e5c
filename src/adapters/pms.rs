//! Property-management system adapter.
//!
//! Endpoints fall into two classes with different envelopes:
//! - reads: 8 s timeout, up to 2 retries with 1 s / 2 s backoff;
//! - transactional writes: 30 s timeout, never retried. The PMS has no
//!   idempotency key, so a blind retry of a create could double-book.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Method;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::PmsConfig;
use crate::errors::ServiceError;
use crate::models::{Guest, GuestCount};

const READ_RETRIES: u32 = 2;
const READ_BACKOFF: [Duration; 2] = [Duration::from_secs(1), Duration::from_secs(2)];

#[derive(Debug, thiserror::Error)]
pub enum PmsError {
    #[error("PMS rejected the request ({status}): {message}")]
    Client { status: u16, message: String },

    #[error("PMS failed ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("PMS request timed out after {0:?}")]
    Timeout(Duration),

    #[error("PMS transport failure: {0}")]
    Transport(String),
}

impl PmsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PmsError::Client { status: 404, .. })
    }

    fn is_retryable(&self) -> bool {
        // 4xx is definitive; everything else may be transient
        !matches!(self, PmsError::Client { .. })
    }
}

impl From<PmsError> for ServiceError {
    fn from(err: PmsError) -> Self {
        match err {
            PmsError::Client { status, message } => ServiceError::PmsClient { status, message },
            PmsError::Server { .. } | PmsError::Transport(_) => {
                ServiceError::PmsServer(err.to_string())
            }
            PmsError::Timeout(_) => ServiceError::PmsTimeout(err.to_string()),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ListingDetail {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub max_guests: Option<u32>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PriceQuote {
    pub total: i64,
    pub currency: String,
    pub subtotal: i64,
    #[serde(default)]
    pub cleaning_fee: i64,
    #[serde(default)]
    pub service_fee: i64,
    #[serde(default)]
    pub taxes: i64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CalendarDay {
    pub date: NaiveDate,
    pub available: bool,
    #[serde(default)]
    pub price: Option<i64>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ListingSearch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_in: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_out: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guests: Option<u32>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ListingSummary {
    pub id: String,
    pub name: String,
}

/// Reservation lifecycle discriminator on the PMS side
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationType {
    Reserved,
    Booked,
    Canceled,
}

impl ReservationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationType::Reserved => "reserved",
            ReservationType::Booked => "booked",
            ReservationType::Canceled => "canceled",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateReservation {
    pub listing_id: String,
    #[serde(rename = "type")]
    pub reservation_type: ReservationType,
    pub guest: Guest,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub guests: GuestCount,
    pub total_price: i64,
    pub currency: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ReservationPatch {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub reservation_type: Option<ReservationType>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub id: String,
    pub listing_id: String,
    #[serde(rename = "type")]
    pub reservation_type: ReservationType,
    #[serde(default)]
    pub booking_code: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRegistration {
    pub amount: i64,
    pub currency: String,
    pub method: String,
    /// Treated by the PMS as a dedup key; replays are no-ops
    pub reference: String,
}

/// Typed operations against the property-management API
#[async_trait]
pub trait PmsApi: Send + Sync {
    async fn get_listing_detail(&self, listing_id: &str) -> Result<ListingDetail, PmsError>;

    async fn calculate_price(
        &self,
        listing_id: &str,
        check_in: NaiveDate,
        check_out: NaiveDate,
        guests: &GuestCount,
        coupon_code: Option<&str>,
    ) -> Result<PriceQuote, PmsError>;

    async fn get_calendar(
        &self,
        listing_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<CalendarDay>, PmsError>;

    async fn search_listings(&self, query: &ListingSearch)
        -> Result<Vec<ListingSummary>, PmsError>;

    /// All reservations currently in the given lifecycle type; the
    /// reconciliation task scans `reserved` entries with it.
    async fn list_reservations(
        &self,
        reservation_type: ReservationType,
    ) -> Result<Vec<Reservation>, PmsError>;

    async fn create_reservation(&self, req: &CreateReservation) -> Result<Reservation, PmsError>;

    async fn update_reservation(
        &self,
        reservation_id: &str,
        patch: &ReservationPatch,
    ) -> Result<Reservation, PmsError>;

    async fn cancel_reservation(&self, reservation_id: &str) -> Result<(), PmsError>;

    async fn get_reservation(&self, reservation_id: &str) -> Result<Reservation, PmsError>;

    async fn register_payment(
        &self,
        reservation_id: &str,
        payment: &PaymentRegistration,
    ) -> Result<(), PmsError>;
}

/// reqwest-backed client
pub struct HttpPmsClient {
    http: reqwest::Client,
    base_url: String,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl HttpPmsClient {
    pub fn new(config: &PmsConfig) -> Result<Self, ServiceError> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!(
            "Bearer {}",
            config.api_key
        ))
        .map_err(|e| ServiceError::Internal(format!("invalid PMS api key: {}", e)))?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| ServiceError::Internal(format!("failed to build PMS client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            read_timeout: Duration::from_secs(config.read_timeout_secs),
            write_timeout: Duration::from_secs(config.write_timeout_secs),
        })
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<T, PmsError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.request(method, &url).timeout(timeout);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                PmsError::Timeout(timeout)
            } else {
                PmsError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| PmsError::Transport(format!("invalid PMS response body: {}", e)));
        }

        let message = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(PmsError::Client {
                status: status.as_u16(),
                message,
            })
        } else {
            Err(PmsError::Server {
                status: status.as_u16(),
                message,
            })
        }
    }

    /// Read class: bounded retries with backoff
    async fn read<T: DeserializeOwned>(&self, path: &str) -> Result<T, PmsError> {
        let mut attempt = 0;
        loop {
            match self
                .send(Method::GET, path, None, self.read_timeout)
                .await
            {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < READ_RETRIES => {
                    warn!(path, attempt, error = %e, "PMS read failed, retrying");
                    tokio::time::sleep(READ_BACKOFF[attempt as usize]).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write class: single attempt
    async fn write<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &Value,
    ) -> Result<T, PmsError> {
        debug!(path, "PMS write");
        self.send(method, path, Some(body), self.write_timeout).await
    }
}

#[async_trait]
impl PmsApi for HttpPmsClient {
    async fn get_listing_detail(&self, listing_id: &str) -> Result<ListingDetail, PmsError> {
        self.read(&format!("/listings/{}", listing_id)).await
    }

    async fn calculate_price(
        &self,
        listing_id: &str,
        check_in: NaiveDate,
        check_out: NaiveDate,
        guests: &GuestCount,
        coupon_code: Option<&str>,
    ) -> Result<PriceQuote, PmsError> {
        let mut path = format!(
            "/listings/{}/price?checkIn={}&checkOut={}&adults={}&children={}&infants={}",
            listing_id, check_in, check_out, guests.adults, guests.children, guests.infants
        );
        if let Some(coupon) = coupon_code {
            path.push_str(&format!("&coupon={}", coupon));
        }
        self.read(&path).await
    }

    async fn get_calendar(
        &self,
        listing_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<CalendarDay>, PmsError> {
        self.read(&format!(
            "/listings/{}/calendar?from={}&to={}",
            listing_id, from, to
        ))
        .await
    }

    async fn search_listings(
        &self,
        query: &ListingSearch,
    ) -> Result<Vec<ListingSummary>, PmsError> {
        let mut path = "/listings?".to_string();
        if let Some(city) = &query.city {
            path.push_str(&format!("city={}&", city));
        }
        if let (Some(check_in), Some(check_out)) = (query.check_in, query.check_out) {
            path.push_str(&format!("checkIn={}&checkOut={}&", check_in, check_out));
        }
        if let Some(guests) = query.guests {
            path.push_str(&format!("guests={}&", guests));
        }
        self.read(path.trim_end_matches(['&', '?'])).await
    }

    async fn list_reservations(
        &self,
        reservation_type: ReservationType,
    ) -> Result<Vec<Reservation>, PmsError> {
        self.read(&format!("/reservations?type={}", reservation_type.as_str()))
            .await
    }

    async fn create_reservation(&self, req: &CreateReservation) -> Result<Reservation, PmsError> {
        let body = serde_json::to_value(req)
            .map_err(|e| PmsError::Transport(format!("failed to encode reservation: {}", e)))?;
        self.write(Method::POST, "/reservations", &body).await
    }

    async fn update_reservation(
        &self,
        reservation_id: &str,
        patch: &ReservationPatch,
    ) -> Result<Reservation, PmsError> {
        let body = serde_json::to_value(patch)
            .map_err(|e| PmsError::Transport(format!("failed to encode patch: {}", e)))?;
        self.write(
            Method::PATCH,
            &format!("/reservations/{}", reservation_id),
            &body,
        )
        .await
    }

    async fn cancel_reservation(&self, reservation_id: &str) -> Result<(), PmsError> {
        let _: Value = self
            .write(
                Method::POST,
                &format!("/reservations/{}/cancel", reservation_id),
                &Value::Null,
            )
            .await?;
        Ok(())
    }

    async fn get_reservation(&self, reservation_id: &str) -> Result<Reservation, PmsError> {
        self.read(&format!("/reservations/{}", reservation_id)).await
    }

    async fn register_payment(
        &self,
        reservation_id: &str,
        payment: &PaymentRegistration,
    ) -> Result<(), PmsError> {
        let body = serde_json::to_value(payment)
            .map_err(|e| PmsError::Transport(format!("failed to encode payment: {}", e)))?;
        let _: Value = self
            .write(
                Method::POST,
                &format!("/reservations/{}/payments", reservation_id),
                &body,
            )
            .await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct InMemoryPmsState {
    reservations: HashMap<String, Reservation>,
    payments_by_reference: HashMap<String, PaymentRegistration>,
    cancel_calls: Vec<String>,
    create_calls: u32,
    next_id: u32,
    fail_create: bool,
    price: Option<PriceQuote>,
    booking_code: String,
}

/// In-memory PMS for tests: stable semantics for replayed writes, call
/// recording for assertions.
#[derive(Debug, Default)]
pub struct InMemoryPms {
    state: Mutex<InMemoryPmsState>,
}

impl InMemoryPms {
    pub fn new() -> Self {
        let pms = Self::default();
        pms.state.lock().unwrap().booking_code = "B42".to_string();
        pms
    }

    pub fn set_price(&self, price: PriceQuote) {
        self.state.lock().unwrap().price = Some(price);
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.state.lock().unwrap().fail_create = fail;
    }

    pub fn create_calls(&self) -> u32 {
        self.state.lock().unwrap().create_calls
    }

    pub fn cancel_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().cancel_calls.clone()
    }

    pub fn payment_count(&self) -> usize {
        self.state.lock().unwrap().payments_by_reference.len()
    }

    pub fn reservation(&self, id: &str) -> Option<Reservation> {
        self.state.lock().unwrap().reservations.get(id).cloned()
    }

    /// Test hook: shifts a reservation's creation time into the past.
    pub fn backdate_reservation(&self, id: &str, created_at: DateTime<Utc>) {
        if let Some(reservation) = self.state.lock().unwrap().reservations.get_mut(id) {
            reservation.created_at = Some(created_at);
        }
    }
}

#[async_trait]
impl PmsApi for InMemoryPms {
    async fn get_listing_detail(&self, listing_id: &str) -> Result<ListingDetail, PmsError> {
        Ok(ListingDetail {
            id: listing_id.to_string(),
            name: format!("Listing {}", listing_id),
            max_guests: Some(6),
        })
    }

    async fn calculate_price(
        &self,
        _listing_id: &str,
        _check_in: NaiveDate,
        _check_out: NaiveDate,
        _guests: &GuestCount,
        _coupon_code: Option<&str>,
    ) -> Result<PriceQuote, PmsError> {
        Ok(self.state.lock().unwrap().price.clone().unwrap_or(PriceQuote {
            total: 120_000,
            currency: "BRL".to_string(),
            subtotal: 100_000,
            cleaning_fee: 10_000,
            service_fee: 5_000,
            taxes: 5_000,
        }))
    }

    async fn get_calendar(
        &self,
        _listing_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<CalendarDay>, PmsError> {
        let mut days = Vec::new();
        let mut date = from;
        while date < to {
            days.push(CalendarDay {
                date,
                available: true,
                price: None,
            });
            date = date.succ_opt().expect("date overflow");
        }
        Ok(days)
    }

    async fn search_listings(
        &self,
        _query: &ListingSearch,
    ) -> Result<Vec<ListingSummary>, PmsError> {
        Ok(vec![ListingSummary {
            id: "L1".to_string(),
            name: "Listing L1".to_string(),
        }])
    }

    async fn list_reservations(
        &self,
        reservation_type: ReservationType,
    ) -> Result<Vec<Reservation>, PmsError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .reservations
            .values()
            .filter(|r| r.reservation_type == reservation_type)
            .cloned()
            .collect())
    }

    async fn create_reservation(&self, req: &CreateReservation) -> Result<Reservation, PmsError> {
        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;
        if state.fail_create {
            return Err(PmsError::Server {
                status: 500,
                message: "reservation backend unavailable".to_string(),
            });
        }
        state.next_id += 1;
        let reservation = Reservation {
            id: format!("R{}", state.next_id),
            listing_id: req.listing_id.clone(),
            reservation_type: req.reservation_type,
            booking_code: None,
            created_at: Some(Utc::now()),
        };
        state
            .reservations
            .insert(reservation.id.clone(), reservation.clone());
        Ok(reservation)
    }

    async fn update_reservation(
        &self,
        reservation_id: &str,
        patch: &ReservationPatch,
    ) -> Result<Reservation, PmsError> {
        let mut state = self.state.lock().unwrap();
        let booking_code = state.booking_code.clone();
        let reservation = state
            .reservations
            .get_mut(reservation_id)
            .ok_or(PmsError::Client {
                status: 404,
                message: format!("reservation {} not found", reservation_id),
            })?;
        if let Some(rtype) = patch.reservation_type {
            // replaying the same terminal type is a no-op
            reservation.reservation_type = rtype;
            if rtype == ReservationType::Booked && reservation.booking_code.is_none() {
                reservation.booking_code = Some(booking_code);
            }
        }
        Ok(reservation.clone())
    }

    async fn cancel_reservation(&self, reservation_id: &str) -> Result<(), PmsError> {
        let mut state = self.state.lock().unwrap();
        state.cancel_calls.push(reservation_id.to_string());
        match state.reservations.get_mut(reservation_id) {
            Some(reservation) => {
                reservation.reservation_type = ReservationType::Canceled;
                Ok(())
            }
            None => Err(PmsError::Client {
                status: 404,
                message: format!("reservation {} not found", reservation_id),
            }),
        }
    }

    async fn get_reservation(&self, reservation_id: &str) -> Result<Reservation, PmsError> {
        self.state
            .lock()
            .unwrap()
            .reservations
            .get(reservation_id)
            .cloned()
            .ok_or(PmsError::Client {
                status: 404,
                message: format!("reservation {} not found", reservation_id),
            })
    }

    async fn register_payment(
        &self,
        reservation_id: &str,
        payment: &PaymentRegistration,
    ) -> Result<(), PmsError> {
        let mut state = self.state.lock().unwrap();
        if !state.reservations.contains_key(reservation_id) {
            return Err(PmsError::Client {
                status: 404,
                message: format!("reservation {} not found", reservation_id),
            });
        }
        // reference doubles as the dedup key
        state
            .payments_by_reference
            .entry(payment.reference.clone())
            .or_insert_with(|| payment.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_not_retryable() {
        let err = PmsError::Client {
            status: 422,
            message: "bad dates".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(PmsError::Timeout(Duration::from_secs(8)).is_retryable());
        assert!(PmsError::Server {
            status: 503,
            message: String::new()
        }
        .is_retryable());
    }

    #[test]
    fn error_mapping_follows_the_taxonomy() {
        let client: ServiceError = PmsError::Client {
            status: 409,
            message: "overlap".to_string(),
        }
        .into();
        assert_eq!(client.code(), "PMS_CLIENT_ERROR");

        let server: ServiceError = PmsError::Server {
            status: 500,
            message: String::new(),
        }
        .into();
        assert_eq!(server.code(), "PMS_SERVER_ERROR");

        let timeout: ServiceError = PmsError::Timeout(Duration::from_secs(30)).into();
        assert_eq!(timeout.code(), "PMS_TIMEOUT");
    }

    #[tokio::test]
    async fn fake_registers_payment_once_per_reference() {
        let pms = InMemoryPms::new();
        let guest = Guest {
            first_name: "Ana".to_string(),
            last_name: "Souza".to_string(),
            email: "ana@example.com".to_string(),
            phone: "+5511999990000".to_string(),
            document: None,
        };
        let reservation = pms
            .create_reservation(&CreateReservation {
                listing_id: "L1".to_string(),
                reservation_type: ReservationType::Reserved,
                guest,
                check_in: NaiveDate::from_ymd_opt(2026, 9, 1).unwrap(),
                check_out: NaiveDate::from_ymd_opt(2026, 9, 4).unwrap(),
                guests: GuestCount {
                    adults: 2,
                    children: 0,
                    infants: 0,
                },
                total_price: 120_000,
                currency: "BRL".to_string(),
            })
            .await
            .unwrap();

        let payment = PaymentRegistration {
            amount: 120_000,
            currency: "BRL".to_string(),
            method: "credit_card".to_string(),
            reference: "pi_1".to_string(),
        };
        pms.register_payment(&reservation.id, &payment).await.unwrap();
        pms.register_payment(&reservation.id, &payment).await.unwrap();
        assert_eq!(pms.payment_count(), 1);
    }

    #[tokio::test]
    async fn fake_update_to_booked_assigns_booking_code_once() {
        let pms = InMemoryPms::new();
        let guest = Guest {
            first_name: "Ana".to_string(),
            last_name: "Souza".to_string(),
            email: "ana@example.com".to_string(),
            phone: "+5511999990000".to_string(),
            document: None,
        };
        let reservation = pms
            .create_reservation(&CreateReservation {
                listing_id: "L1".to_string(),
                reservation_type: ReservationType::Reserved,
                guest,
                check_in: NaiveDate::from_ymd_opt(2026, 9, 1).unwrap(),
                check_out: NaiveDate::from_ymd_opt(2026, 9, 4).unwrap(),
                guests: GuestCount {
                    adults: 2,
                    children: 0,
                    infants: 0,
                },
                total_price: 120_000,
                currency: "BRL".to_string(),
            })
            .await
            .unwrap();

        let patch = ReservationPatch {
            reservation_type: Some(ReservationType::Booked),
        };
        let first = pms.update_reservation(&reservation.id, &patch).await.unwrap();
        let second = pms.update_reservation(&reservation.id, &patch).await.unwrap();
        assert_eq!(first.booking_code.as_deref(), Some("B42"));
        assert_eq!(second.booking_code, first.booking_code);
    }

    #[tokio::test]
    async fn fake_cancel_tolerance_is_callers_concern() {
        let pms = InMemoryPms::new();
        let err = pms.cancel_reservation("R404").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(pms.cancel_calls(), vec!["R404".to_string()]);
    }
}

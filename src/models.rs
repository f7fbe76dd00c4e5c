use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

/// Lifecycle states of a checkout (§4.3 transition graph)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckoutState {
    Initiated,
    HoldCreated,
    PaymentCreated,
    Paid,
    Booked,
    Canceled,
    Expired,
    Failed,
}

impl CheckoutState {
    /// Terminal states are sinks, except BOOKED which still admits the
    /// post-booking cancellation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CheckoutState::Booked
                | CheckoutState::Canceled
                | CheckoutState::Expired
                | CheckoutState::Failed
        )
    }

    /// States the hold expiration sweep considers releasable
    pub const EXPIRABLE: [CheckoutState; 2] =
        [CheckoutState::HoldCreated, CheckoutState::PaymentCreated];
}

impl std::fmt::Display for CheckoutState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CheckoutState::Initiated => "INITIATED",
            CheckoutState::HoldCreated => "HOLD_CREATED",
            CheckoutState::PaymentCreated => "PAYMENT_CREATED",
            CheckoutState::Paid => "PAID",
            CheckoutState::Booked => "BOOKED",
            CheckoutState::Canceled => "CANCELED",
            CheckoutState::Expired => "EXPIRED",
            CheckoutState::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

/// Who drove a transition
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    User,
    System,
    Webhook,
}

impl Default for Actor {
    fn default() -> Self {
        Actor::System
    }
}

/// One entry of the append-only transition log
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StateTransition {
    pub from: CheckoutState,
    pub to: CheckoutState,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub actor: Actor,
}

/// Party sizes for the stay
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema, Validate)]
pub struct GuestCount {
    #[validate(range(min = 1, message = "at least one adult is required"))]
    pub adults: u32,
    #[serde(default)]
    pub children: u32,
    #[serde(default)]
    pub infants: u32,
}

/// Price components, integer minor units
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuoteBreakdown {
    pub subtotal: i64,
    pub cleaning_fee: i64,
    pub service_fee: i64,
    pub taxes: i64,
}

/// The locked quote: the authoritative amount charged. Write-once.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    /// Total in minor units of `currency`
    pub total: i64,
    pub currency: String,
    pub breakdown: QuoteBreakdown,
    /// SHA-256 over the canonical join of the booking inputs
    pub hash: String,
    pub expires_at: DateTime<Utc>,
}

/// Guest contact details, required before a hold is taken
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Guest {
    #[validate(length(min = 1))]
    pub first_name: String,
    #[validate(length(min = 1))]
    pub last_name: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 5))]
    pub phone: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
}

/// The aggregate root: one document per shopper attempt
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Checkout {
    pub checkout_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: CheckoutState,
    pub state_history: Vec<StateTransition>,

    pub listing_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listing_name: Option<String>,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub guests: GuestCount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coupon_code: Option<String>,

    pub quote: Quote,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest: Option<Guest>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pms_reservation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pms_booking_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub psp_payment_intent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hold_expires_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub retry_count: u32,
    /// Set when a payment succeeded for a checkout whose hold was already
    /// released; funds must be returned out of band.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub refund_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Computes the canonical quote hash:
/// `listingId|checkIn|checkOut|adults|children|infants|couponCode`, SHA-256.
pub fn quote_hash(
    listing_id: &str,
    check_in: NaiveDate,
    check_out: NaiveDate,
    guests: &GuestCount,
    coupon_code: Option<&str>,
) -> String {
    let canonical = format!(
        "{}|{}|{}|{}|{}|{}|{}",
        listing_id,
        check_in.format("%Y-%m-%d"),
        check_out.format("%Y-%m-%d"),
        guests.adults,
        guests.children,
        guests.infants,
        coupon_code.unwrap_or("")
    );
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)
}

impl Checkout {
    /// Recomputes the quote hash from the stored immutable inputs.
    pub fn expected_quote_hash(&self) -> String {
        quote_hash(
            &self.listing_id,
            self.check_in,
            self.check_out,
            &self.guests,
            self.coupon_code.as_deref(),
        )
    }
}

/// Rejected write-once mutation
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct PatchConflict(pub String);

/// The only document fields a transition may update besides the machine-managed
/// ones. `state`, `stateHistory` and `updatedAt` are unexpressible here on
/// purpose; write-once fields reject overwrites with a different value.
#[derive(Clone, Debug, Default)]
pub struct CheckoutPatch {
    pub pms_reservation_id: Option<String>,
    pub psp_payment_intent_id: Option<String>,
    pub pms_booking_code: Option<String>,
    pub hold_expires_at: Option<DateTime<Utc>>,
    pub increment_retry: bool,
}

impl CheckoutPatch {
    pub fn apply(&self, checkout: &mut Checkout) -> Result<(), PatchConflict> {
        if let Some(id) = &self.pms_reservation_id {
            match &checkout.pms_reservation_id {
                Some(existing) if existing != id => {
                    return Err(PatchConflict(format!(
                        "pmsReservationId is already {}",
                        existing
                    )));
                }
                _ => checkout.pms_reservation_id = Some(id.clone()),
            }
        }
        if let Some(id) = &self.psp_payment_intent_id {
            match &checkout.psp_payment_intent_id {
                Some(existing) if existing != id => {
                    return Err(PatchConflict(format!(
                        "pspPaymentIntentId is already {}",
                        existing
                    )));
                }
                _ => checkout.psp_payment_intent_id = Some(id.clone()),
            }
        }
        if let Some(code) = &self.pms_booking_code {
            match &checkout.pms_booking_code {
                Some(existing) if existing != code => {
                    return Err(PatchConflict(format!(
                        "pmsBookingCode is already {}",
                        existing
                    )));
                }
                _ => checkout.pms_booking_code = Some(code.clone()),
            }
        }
        if let Some(at) = self.hold_expires_at {
            checkout.hold_expires_at = Some(at);
        }
        if self.increment_retry {
            checkout.retry_count += 1;
        }
        Ok(())
    }
}

/// Captured response for a replayed request, keyed by `(endpoint, key)`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub endpoint: String,
    pub key: String,
    /// None while the first execution is still in flight
    pub status: Option<u16>,
    pub body: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Remembered PSP webhook delivery, keyed by event id
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEventRecord {
    pub event_id: String,
    pub processed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

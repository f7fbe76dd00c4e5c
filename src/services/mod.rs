pub mod checkout;
pub mod expiration;
pub mod idempotency;

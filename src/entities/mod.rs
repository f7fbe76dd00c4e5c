pub mod checkout;
pub mod idempotency_key;
pub mod webhook_event;

pub mod cache;
pub mod checkout;
pub mod database;
pub mod memory;
pub mod metrics;
pub mod notifier;
pub mod payment;
pub mod payment_code;
pub mod qr;
pub mod reconciler;
pub mod store;

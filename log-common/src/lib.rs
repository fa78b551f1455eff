pub mod config;
pub mod health;
pub mod metrics;
pub mod normalize;
pub mod pgqueue;
pub mod pgstore;
pub mod queue;
pub mod record;
pub mod redact;
pub mod retry;
pub mod store;

pub mod config;
pub mod context;
pub mod dispatch;
pub mod export;
pub mod gcp;
pub mod import;
pub mod kinds;
pub mod metrics;
pub mod notification;
pub mod pgqueue;
pub mod queue;
pub mod retry;
pub mod server;
pub mod test_utils;

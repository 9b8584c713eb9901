pub mod config;
pub mod diagnostics;
pub mod error;
pub mod event;
pub mod handler;
pub mod kafka;
pub mod metrics_consts;

pub mod api;
pub mod breaker;
pub mod config;
pub mod humanize;
pub mod observability;
pub mod pipeline;
pub mod replay;
pub mod storage;
pub mod streaming;
pub mod wiring;

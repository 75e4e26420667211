pub mod api;
pub mod backoff;
pub mod batch;
pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod gate;
pub mod hasher;
pub mod metrics;
pub mod metrics_const;
pub mod publish;
pub mod source;
pub mod store;
pub mod types;

pub mod analytics;
pub mod api;
pub mod broker;
pub mod config;
pub mod error;
pub mod etl;
pub mod ingestion;
pub mod interfaces;
pub mod jobs;
pub mod observability;
pub mod runtime;
pub mod storage;
pub mod types;
pub mod utils;

// Environment selecting the `config/<env>` overlay
pub const ENV_VAR: &str = "MARKETFLOW_ENV";
pub const DEFAULT_ENV: &str = "local";

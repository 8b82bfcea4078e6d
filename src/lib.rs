pub mod config;
pub mod db;
pub mod errors;
pub mod exchange;
pub mod execution;
pub mod ingestion;
pub mod metrics;
pub mod models;
pub mod services;
pub mod vault;

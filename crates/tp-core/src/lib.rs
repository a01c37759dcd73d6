pub mod config;
pub mod dedup;
pub mod pipeline_store;
pub mod ports;
pub mod store;
pub mod types;

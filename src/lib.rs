pub mod agg;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod export;
pub mod lock;
pub mod migrate;
pub mod service;
pub mod store;

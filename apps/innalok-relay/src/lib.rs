pub mod app;
pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod health;
pub mod receipts;
pub mod registry;
pub mod relay;
pub mod settings;
pub mod status;
pub mod store;
pub mod telemetry;

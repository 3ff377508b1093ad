pub mod config;
pub mod controller;
pub mod engine;
pub mod errors;
pub mod notify;
pub mod provision;
pub mod settings;
pub mod store;

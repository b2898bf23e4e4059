pub mod config;
pub mod error;
pub mod hub;
pub mod k8s;
pub mod server;

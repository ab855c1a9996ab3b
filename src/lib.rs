pub mod assistant;
pub mod auth;
pub mod config;
pub mod error;
pub mod feed;
pub mod http_client;
pub mod hub;
pub mod markers;
pub mod models;
pub mod pipeline;
pub mod protocol;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod store;

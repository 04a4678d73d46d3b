pub mod app_state;
pub mod attachments;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod history;
pub mod ids;
pub mod llm;
pub mod membership;
pub mod middlewares;
pub mod models;
pub mod queries;
pub mod routes;
pub mod scheduler;
pub mod search;
pub mod store;
pub mod telemetry;
pub mod websocket;

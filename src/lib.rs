pub mod auth;
pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
pub mod websocket;

pub use state::AppState;
pub use websocket::SessionRegistry;

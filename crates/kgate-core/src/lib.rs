pub mod auth;
pub mod bootstrap;
pub mod breaker;
pub mod classify;
pub mod config;
pub mod engine;
pub mod error;
pub mod keys;
pub mod limiter;
pub mod metrics;
pub mod models;
pub mod settings;

pub use auth::AuthContext;
pub use bootstrap::{AppState, bootstrap};
pub use config::ProxyConfig;
pub use engine::{ApiDialect, Engine, EngineResponse};
pub use error::EngineError;

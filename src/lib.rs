pub mod auth;
pub mod authoring;
pub mod config;
pub mod engagement;
pub mod error;
pub mod feed;
pub mod live;
pub mod models;
pub mod openapi;
pub mod profile;
pub mod rate_limit; // in-memory rate limiting
pub mod repo;
pub mod routes;
pub mod schema;
pub mod storage;
pub mod store;

// Re-export commonly used items for tests / external users
pub use routes::{config as configure_routes, AppState};

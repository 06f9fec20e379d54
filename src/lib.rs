pub mod auth;
pub mod error;
pub mod mail;
pub mod models;
pub mod openapi;
pub mod permissions;
pub mod rate_limit;
pub mod repo;
pub mod routes;
pub mod security;
pub mod validate;

// Re-export commonly used items for tests / external users
pub use routes::{config, AppState};
pub use security::SecurityHeaders;

pub mod auth;
pub mod cors;

pub use auth::{admin_auth_middleware, auth_middleware};
pub use cors::cors_layer;

use tower_http::cors::{Any, CorsLayer};

/// Permissive CORS for the local proxy surface: callers are local tools and
/// browser-based clients pointing at 127.0.0.1.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .max_age(std::time::Duration::from_secs(86400))
}

use super::{
    config::{Config, MAX_UPLOAD_BYTES},
    controllers, middleware,
    models::AppState,
};
use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderName, HeaderValue, Method},
    middleware::from_fn,
    routing::{delete, get, post, put, Router},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

#[rustfmt::skip]
pub fn get_routes() -> Router<AppState> {
    Router::new()
        .route("/api/health", get(controllers::health))
        .route("/api/auth/register", post(controllers::register))
        .route("/api/auth/login", post(controllers::login))
        .route("/api/notes", get(controllers::list_notes))
        .route("/api/notes/mynotes", get(controllers::my_notes))
        .route("/api/notes/user/:user_id", get(controllers::user_notes))
        .route("/api/notes/upload", post(controllers::upload_note)
            .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)))
        .route("/api/notes/:id", get(controllers::get_note))
        .route("/api/notes/:id", put(controllers::update_note))
        .route("/api/notes/:id", delete(controllers::delete_note))
        .route("/api/notes/:id/download", put(controllers::download_note))
        .route("/api/notes/:id/toggle-featured", put(controllers::toggle_featured))
        .route("/api/notes/:id/reviews", post(controllers::add_review))
        .route("/api/notes/:id/comments", get(controllers::list_comments))
        .route("/api/notes/:id/comments", post(controllers::add_comment))
        .route("/api/comments/:id", delete(controllers::delete_comment))
        .route("/api/users", get(controllers::list_users))
        .route("/api/users/profile", get(controllers::get_profile))
        .route("/api/users/profile", put(controllers::update_profile))
        .route("/api/users/savednotes", get(controllers::saved_notes))
        .route("/api/users/save/:note_id", put(controllers::save_note))
        .route("/api/users/unsave/:note_id", put(controllers::unsave_note))
        .route("/api/users/:id", delete(controllers::delete_user))
        .route("/api/users/:id/role", put(controllers::toggle_role))
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any)
        .expose_headers([
            HeaderName::from_static("x-total-count"),
            HeaderName::from_static("x-total-pages"),
        ])
        .allow_credentials(false)
}

/// The full application: routes, middleware and state.
pub fn app(state: AppState) -> Router {
    let cors = cors_layer(&state.config);
    get_routes()
        .layer(from_fn(middleware::security_headers))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

use axum::{middleware, Router};
use std::sync::Arc;
use tower_governor::key_extractor::PeerIpKeyExtractor;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};

use crate::auth::handlers as auth_handlers;
use crate::auth::middleware::JwtSecret;
use crate::chat::history;
use crate::groups;
use crate::state::AppState;
use crate::users;
use crate::ws::handler as ws_handler;

/// Inject the JWT secret into request extensions so the Claims extractor can find it.
async fn inject_jwt_secret(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> axum::response::Response {
    req.extensions_mut()
        .insert(JwtSecret(state.jwt_secret.clone()));
    next.run(req).await
}

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    // Rate limiting: 5 requests per minute per IP on auth endpoints
    // Uses PeerIpKeyExtractor which reads from ConnectInfo<SocketAddr>
    let governor_config = Arc::new(
        GovernorConfigBuilder::default()
            .key_extractor(PeerIpKeyExtractor)
            .per_second(12) // 1 token every 12 seconds = 5 per minute
            .burst_size(5) // Allow burst of 5
            .finish()
            .expect("Failed to build governor config"),
    );
    let governor_limiter = governor_config.limiter().clone();

    // Spawn background task to clean up rate limiter state
    let limiter_for_cleanup = governor_limiter.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            limiter_for_cleanup.retain_recent();
        }
    });

    // Auth routes with rate limiting
    let auth_routes = Router::new()
        .route(
            "/api/auth/register",
            axum::routing::post(auth_handlers::register),
        )
        .route("/api/auth/login", axum::routing::post(auth_handlers::login))
        .layer(GovernorLayer {
            config: governor_config,
        });

    // Authenticated routes (JWT required — Claims extractor validates token)
    // Note: /api/users/online and /api/users/search MUST come before
    // /api/users/{id} to avoid path param conflicts.
    let user_routes = Router::new()
        .route("/api/users/me", axum::routing::get(users::me))
        .route("/api/users/online", axum::routing::get(users::online_users))
        .route("/api/users/search", axum::routing::get(users::search_users))
        .route(
            "/api/users/username/{username}",
            axum::routing::get(users::get_user_by_username),
        )
        .route("/api/users/{id}", axum::routing::get(users::get_user));

    let group_routes = Router::new()
        .route("/api/groups", axum::routing::post(groups::create_group))
        .route("/api/groups/my", axum::routing::get(groups::my_groups))
        .route("/api/groups/search", axum::routing::get(groups::search_groups))
        .route("/api/groups/{id}", axum::routing::get(groups::get_group))
        .route("/api/groups/{id}", axum::routing::delete(groups::delete_group))
        .route(
            "/api/groups/{id}/members",
            axum::routing::get(groups::group_members),
        )
        .route(
            "/api/groups/{id}/join",
            axum::routing::post(groups::join_group),
        )
        .route(
            "/api/groups/{id}/leave",
            axum::routing::delete(groups::leave_group),
        )
        .route(
            "/api/groups/{id}/members/{user_id}",
            axum::routing::delete(groups::kick_member),
        );

    let message_routes = Router::new()
        .route(
            "/api/messages/private/{user_id}",
            axum::routing::get(history::private_history),
        )
        .route(
            "/api/messages/group/{group_id}",
            axum::routing::get(history::group_history),
        )
        .route(
            "/api/messages/unread",
            axum::routing::get(history::unread_messages),
        )
        .route(
            "/api/messages/read/{sender_id}",
            axum::routing::put(history::mark_read),
        );

    // WebSocket endpoint (auth via query param, header, or cookie)
    let ws_routes = Router::new().route("/ws/chat", axum::routing::get(ws_handler::ws_upgrade));

    // Health check
    let health = Router::new().route("/health", axum::routing::get(health_check));

    Router::new()
        .merge(auth_routes)
        .merge(user_routes)
        .merge(group_routes)
        .merge(message_routes)
        .merge(ws_routes)
        .merge(health)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            inject_jwt_secret,
        ))
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}

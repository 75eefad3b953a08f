use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{get, post, put},
};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use notehub_api::middleware::require_auth;
use notehub_api::{AppState, AppStateInner, messages, rooms};
use notehub_chat::Chat;
use notehub_gateway::AuthVerifier;
use notehub_gateway::connection;

#[derive(Clone)]
struct ServerState {
    chat: Arc<Chat>,
    auth: AuthVerifier,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "notehub=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("NOTEHUB_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let room_secret = std::env::var("NOTEHUB_ROOM_SECRET")
        .unwrap_or_else(|_| "dev-room-secret-change-me".into());
    let db_path = std::env::var("NOTEHUB_DB_PATH").unwrap_or_else(|_| "notehub-chat.db".into());
    let host = std::env::var("NOTEHUB_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("NOTEHUB_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    // Core
    let db = Arc::new(notehub_db::Database::open(&PathBuf::from(&db_path))?);
    let chat = Chat::new(db, room_secret.into_bytes());

    // Background decay/eviction until shutdown flips
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let maintenance = chat.spawn_maintenance(shutdown_rx);

    let app_state: AppState = Arc::new(AppStateInner {
        chat: chat.clone(),
        jwt_secret: jwt_secret.clone(),
    });

    let server_state = ServerState {
        chat: chat.clone(),
        auth: AuthVerifier::new(jwt_secret),
    };

    // Routes
    let rest_routes = Router::new()
        .route("/rooms", post(rooms::create_room))
        .route("/rooms/{room_id}/theme", put(rooms::set_theme))
        .route("/rooms/{room_id}/messages", get(messages::get_messages))
        .route("/rooms/{room_id}/unread", get(messages::get_unread))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_auth))
        .with_state(app_state);

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(server_state);

    let app = Router::new()
        .merge(rest_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("NoteHub chat core listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Teardown: stop maintenance, then drain live sessions.
    let _ = shutdown_tx.send(true);
    let _ = maintenance.await;
    chat.drain().await;
    info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
    }
}

async fn ws_upgrade(
    State(state): State<ServerState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_connection(socket, state.chat, state.auth))
}

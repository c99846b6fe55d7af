mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use sealine_api::auth::{self, AppState, AppStateInner, OtpStore};
use sealine_api::keys;
use sealine_api::messages;
use sealine_api::middleware::{decode_token, require_auth};
use sealine_relay::{Relay, RelayConfig, connection};

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sealine=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env();

    // Init database
    let db = Arc::new(sealine_db::Database::open(&config.db_path)?);

    // Relay core, shared between the REST handlers and the gateway
    let relay = Relay::new(
        db.clone(),
        RelayConfig {
            ack_timeout: config.ack_timeout,
            prekey_low_water: config.prekey_low_water,
            push_retry_max: config.push_retry_max,
        },
    );

    let state: AppState = Arc::new(AppStateInner {
        db,
        relay,
        jwt_secret: config.jwt_secret.clone(),
        otp: OtpStore::new(),
        otp_ttl: config.otp_ttl,
    });

    // Routes
    let public_routes = Router::new()
        .route("/auth/request-otp", post(auth::request_otp))
        .route("/auth/verify-otp", post(auth::verify_otp))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/messages", post(messages::send_message))
        .route("/keys/identity", post(keys::register_identity))
        .route("/keys/{user_id}/bundle", get(keys::get_bundle))
        .route("/keys/{user_id}/prekeys", post(keys::upload_prekeys))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state.clone());

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state);

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Sealine relay listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Deserialize)]
struct GatewayParams {
    token: String,
}

/// Browsers cannot set headers on WebSocket upgrades, so the gateway takes
/// the JWT as a query parameter. Validation happens before the upgrade; the
/// connection handler receives an already-authenticated user id.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<GatewayParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let Some(claims) = decode_token(&state.jwt_secret, &params.token) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let relay = state.relay.clone();
    ws.on_upgrade(move |socket| connection::handle_connection(socket, relay, claims.sub))
        .into_response()
}

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::rejection::StringRejection;
use axum::extract::{ConnectInfo, DefaultBodyLimit, FromRequestParts, Path};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post, put};
use axum::{middleware, Extension, Json, Router};

use crate::coordinator::GameSummary;
use crate::ids::{GameId, PlayerId};
use crate::relay::SaveRelay;
use crate::storage::StorageStats;
use crate::sweeper::SweepReport;

use super::dto::{HistoryResponse, IsAliveResponse, RetentionRequest};
use super::error::ApiError;
use super::logging::log_requests;

const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

#[derive(Clone)]
pub struct ServerContext {
    pub relay: SaveRelay,
    pub admin_token: Option<String>,
}

impl ServerContext {
    fn require_admin(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let supplied = headers
            .get(ADMIN_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok());
        match (&self.admin_token, supplied) {
            (Some(expected), Some(supplied)) if expected == supplied => Ok(()),
            (None, _) => Err(ApiError::unauthorized("admin access is disabled")),
            _ => Err(ApiError::unauthorized("invalid admin token")),
        }
    }
}

/// Axum facade over the relay core.
pub struct SaveRelayServer {
    router: Router,
}

impl SaveRelayServer {
    pub fn new(relay: SaveRelay, admin_token: Option<String>) -> Self {
        let body_limit = relay.config().limits.max_body_bytes;
        let context = Arc::new(ServerContext { relay, admin_token });

        let router = Router::new()
            .route("/isalive", get(is_alive))
            .route("/auth", get(get_auth).put(put_auth))
            .route("/files/:game_id", get(get_file).put(put_file))
            .route("/api/users/games", get(get_user_games))
            .route(
                "/api/games/:game_id",
                put(put_game_retention).delete(delete_game),
            )
            .route("/api/games/:game_id/history", get(get_game_history))
            .route("/api/players/:player_id", put(put_player_retention))
            .route("/api/stats", get(get_stats))
            .route("/api/sweep", post(post_sweep))
            .layer(DefaultBodyLimit::max(body_limit))
            .layer(middleware::from_fn(log_requests))
            .layer(Extension(context));

        Self { router }
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn into_router(self) -> Router {
        self.router
    }
}

/// Caller address: first `X-Forwarded-For` hop, then `X-Real-IP`, then the peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientIp(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(forwarded) = header_value(&parts.headers, "x-forwarded-for") {
            let first = forwarded.split(',').next().unwrap_or(forwarded).trim();
            return Ok(ClientIp(first.to_owned()));
        }
        if let Some(real_ip) = header_value(&parts.headers, "x-real-ip") {
            return Ok(ClientIp(real_ip.to_owned()));
        }
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_owned());
        Ok(ClientIp(peer))
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn authorization(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
}

async fn is_alive() -> Json<IsAliveResponse> {
    Json(IsAliveResponse::default())
}

async fn get_auth(
    Extension(ctx): Extension<Arc<ServerContext>>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
) -> Result<&'static str, ApiError> {
    ctx.relay
        .auth()
        .authenticate_or_register(authorization(&headers), &ip)
        .await?;
    Ok("authenticated")
}

async fn put_auth(
    Extension(ctx): Extension<Arc<ServerContext>>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    body: Result<String, StringRejection>,
) -> Result<&'static str, ApiError> {
    let new_secret = body.map_err(|err| ApiError::bad_request(err.body_text()))?;
    ctx.relay
        .auth()
        .change_secret(authorization(&headers), new_secret.trim(), &ip)
        .await?;
    Ok("secret updated")
}

async fn get_file(
    Extension(ctx): Extension<Arc<ServerContext>>,
    Path(raw_game_id): Path<String>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
) -> Result<String, ApiError> {
    let (game_id, kind) = GameId::parse_with_kind(&raw_game_id)?;
    let viewer = ctx
        .relay
        .auth()
        .require_valid(authorization(&headers), &ip)
        .await?;
    let token = ctx
        .relay
        .coordinator()
        .read(&game_id, kind, Some(&viewer))
        .await?;
    Ok(token)
}

async fn put_file(
    Extension(ctx): Extension<Arc<ServerContext>>,
    Path(raw_game_id): Path<String>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    body: Result<String, StringRejection>,
) -> Result<StatusCode, ApiError> {
    let (game_id, kind) = GameId::parse_with_kind(&raw_game_id)?;
    let player_id = ctx
        .relay
        .auth()
        .require_valid(authorization(&headers), &ip)
        .await?;
    let token = body.map_err(|err| ApiError::bad_request(err.body_text()))?;
    ctx.relay
        .coordinator()
        .write(&player_id, &game_id, &token, kind, &ip)
        .await?;
    Ok(StatusCode::OK)
}

async fn get_game_history(
    Extension(ctx): Extension<Arc<ServerContext>>,
    Path(raw_game_id): Path<String>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
) -> Result<Json<HistoryResponse>, ApiError> {
    let game_id = GameId::parse(&raw_game_id)?;
    let player_id = ctx
        .relay
        .auth()
        .require_valid(authorization(&headers), &ip)
        .await?;
    let turns = ctx.relay.coordinator().history(&game_id, &player_id).await?;
    Ok(Json(HistoryResponse { game_id, turns }))
}

async fn get_user_games(
    Extension(ctx): Extension<Arc<ServerContext>>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
) -> Result<Json<Vec<GameSummary>>, ApiError> {
    let player_id = ctx
        .relay
        .auth()
        .require_valid(authorization(&headers), &ip)
        .await?;
    let games = ctx.relay.coordinator().games_for_player(&player_id).await?;
    Ok(Json(games))
}

async fn delete_game(
    Extension(ctx): Extension<Arc<ServerContext>>,
    Path(raw_game_id): Path<String>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let game_id = GameId::parse(&raw_game_id)?;
    let player_id = ctx
        .relay
        .auth()
        .require_valid(authorization(&headers), &ip)
        .await?;
    ctx.relay
        .coordinator()
        .delete_game(&game_id, Some(&player_id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn put_game_retention(
    Extension(ctx): Extension<Arc<ServerContext>>,
    Path(raw_game_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<RetentionRequest>,
) -> Result<StatusCode, ApiError> {
    ctx.require_admin(&headers)?;
    let game_id = GameId::parse(&raw_game_id)?;
    ctx.relay
        .coordinator()
        .set_game_retention(&game_id, request.whitelisted, request.remark)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn put_player_retention(
    Extension(ctx): Extension<Arc<ServerContext>>,
    Path(raw_player_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<RetentionRequest>,
) -> Result<StatusCode, ApiError> {
    ctx.require_admin(&headers)?;
    let player_id = PlayerId::parse(&raw_player_id)?;
    ctx.relay
        .coordinator()
        .set_player_retention(&player_id, request.whitelisted, request.remark)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_stats(
    Extension(ctx): Extension<Arc<ServerContext>>,
    headers: HeaderMap,
) -> Result<Json<StorageStats>, ApiError> {
    ctx.require_admin(&headers)?;
    Ok(Json(ctx.relay.coordinator().stats().await?))
}

async fn post_sweep(
    Extension(ctx): Extension<Arc<ServerContext>>,
    headers: HeaderMap,
) -> Result<Json<SweepReport>, ApiError> {
    ctx.require_admin(&headers)?;
    Ok(Json(ctx.relay.sweeper().sweep().await?))
}

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

use crate::chain::Chain;
use crate::errors::{ChainError, ChainResult};
use crate::rpc::{AdviseNewBlockReq, AdviseNewBlockResp, FetchBlockResp};
use crate::types::{Peers, Request, Response, SignedAckHeader, SignedResponseHeader};

#[derive(Clone)]
struct AppState {
    chain: Arc<Chain>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    database: String,
}

#[derive(Deserialize)]
struct QueryBody {
    request: Request,
    #[serde(default)]
    leader: bool,
}

#[derive(Serialize)]
struct AckAccepted {
    hash: String,
}

/// Registers the chain RPC service; shuts down with the chain context.
pub async fn serve(chain: Arc<Chain>, addr: SocketAddr) -> ChainResult<()> {
    let cancel = chain.rt.cancellation();
    let state = AppState { chain };
    let router = Router::new()
        .route("/health", get(health))
        .route("/v1/blocks/advise", post(advise_new_block))
        .route("/v1/blocks/height/:height", get(block_by_height))
        .route("/v1/blocks/count/:count", get(block_by_count))
        .route("/v1/queries", post(submit_query))
        .route("/v1/responses", post(add_response))
        .route("/v1/acks", post(push_ack))
        .route("/v1/peers", put(update_peers))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    info!(?addr, "chain RPC service listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(ChainError::Io)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        database: state.chain.database_id().to_string(),
    })
}

async fn advise_new_block(
    State(state): State<AppState>,
    Json(req): Json<AdviseNewBlockReq>,
) -> Result<Json<AdviseNewBlockResp>, (StatusCode, Json<ErrorResponse>)> {
    state
        .chain
        .advise_new_block(req)
        .await
        .map(|_| Json(AdviseNewBlockResp::default()))
        .map_err(to_http_error)
}

async fn block_by_height(
    State(state): State<AppState>,
    Path(height): Path<i32>,
) -> Result<Json<FetchBlockResp>, (StatusCode, Json<ErrorResponse>)> {
    let found = state
        .chain
        .fetch_block_with_node(height)
        .map_err(to_http_error)?;
    let resp = match found {
        Some((block, node)) => FetchBlockResp {
            block: Some(block),
            count: node.count(),
            height: node.height(),
        },
        None => FetchBlockResp {
            block: None,
            count: -1,
            height,
        },
    };
    Ok(Json(resp))
}

async fn block_by_count(
    State(state): State<AppState>,
    Path(count): Path<i32>,
) -> Result<Json<FetchBlockResp>, (StatusCode, Json<ErrorResponse>)> {
    let found = state
        .chain
        .fetch_block_by_count(count)
        .map_err(to_http_error)?;
    let resp = match found {
        Some((block, count, height)) => FetchBlockResp {
            block: Some(block),
            count,
            height,
        },
        None => FetchBlockResp {
            block: None,
            count,
            height: -1,
        },
    };
    Ok(Json(resp))
}

async fn submit_query(
    State(state): State<AppState>,
    Json(body): Json<QueryBody>,
) -> Result<Json<Response>, (StatusCode, Json<ErrorResponse>)> {
    state
        .chain
        .query(body.request, body.leader)
        .await
        .map(|(_, response)| Json(response))
        .map_err(to_http_error)
}

async fn add_response(
    State(state): State<AppState>,
    Json(response): Json<SignedResponseHeader>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    state
        .chain
        .add_response(response)
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(to_http_error)
}

async fn push_ack(
    State(state): State<AppState>,
    Json(ack): Json<SignedAckHeader>,
) -> Result<Json<AckAccepted>, (StatusCode, Json<ErrorResponse>)> {
    let hash = ack.hash.to_string();
    state
        .chain
        .verify_and_push_acked_query(ack)
        .map(|_| Json(AckAccepted { hash }))
        .map_err(to_http_error)
}

async fn update_peers(
    State(state): State<AppState>,
    Json(peers): Json<Peers>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    state
        .chain
        .update_peers(peers)
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(to_http_error)
}

fn to_http_error(err: ChainError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match err {
        ChainError::InvalidBlock
        | ChainError::UnknownProducer
        | ChainError::InvalidProducer
        | ChainError::QueryExpired
        | ChainError::ResponseNotFound
        | ChainError::Crypto(_)
        | ChainError::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

//! The gateway's HTTP surface.

use std::sync::Arc;

use {
    axum::{
        Json, Router,
        extract::{Query, State, WebSocketUpgrade},
        http::{HeaderMap, StatusCode, header},
        response::{IntoResponse, Response},
        routing::{get, post},
    },
    serde::Deserialize,
    tracing::{error, info},
};

use {
    spherical_auth::UserContext,
    spherical_common::Error,
    spherical_hashverifier::CrossNodeMessage,
    spherical_protocol::COMPRESS_ZLIB_STREAM,
};

use crate::{connection, state::GatewayState};

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/api/v1/gateway", get(gateway_ws))
        .route("/api/v1/gateway/cross_node", post(cross_node_token))
        .route("/verify", post(verify_blob))
        .route("/spherical.pub", get(public_key))
        .with_state(state)
}

#[derive(Deserialize)]
struct GatewayQuery {
    compress: Option<String>,
}

async fn gateway_ws(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let compress = query
        .compress
        .as_deref()
        .is_some_and(|v| v.eq_ignore_ascii_case(COMPRESS_ZLIB_STREAM));
    ws.on_upgrade(move |socket| connection::handle_socket(socket, state, compress))
}

/// Exchange a signed cross-node request for a single-use node-auth token.
async fn cross_node_token(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(message): Json<CrossNodeMessage>,
) -> Response {
    match mint_cross_node_token(&state, &headers, message).await {
        Ok(token) => (StatusCode::OK, Json(token)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn mint_cross_node_token(
    state: &GatewayState,
    headers: &HeaderMap,
    message: CrossNodeMessage,
) -> spherical_common::Result<String> {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::unauthorized("authorization header missing"))?;
    let mut user = UserContext::from_auth_header(auth)?;
    if user.same_node() {
        return Err(Error::invalid("users on this node connect directly"));
    }
    if message.hostname.eq_ignore_ascii_case(&state.hostname()) {
        return Err(Error::invalid("cannot accept a cross-node request from ourselves"));
    }

    message.validate_with(&state.verifier).await?;

    // The sending node is now proven; stamp the context with it.
    user.hostname = message.hostname.to_lowercase();
    let bytes = rmp_serde::to_vec_named(&user).map_err(Error::internal)?;
    let token = state.tokens.build_cross_node_token(&bytes).await?;
    info!(hostname = %user.hostname, user_id = user.user_id, "minted node-auth token");
    Ok(token)
}

/// Hash-verifier endpoint: the literal `true` or `false`.
async fn verify_blob(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if body.is_empty() {
        return (StatusCode::BAD_REQUEST, "Not found.").into_response();
    }
    let skip = spherical_hashverifier::client::parse_skip_header(
        headers.get("X-Skip").and_then(|v| v.to_str().ok()),
    );

    let accepted = state.verifier.process_hash_blob(&body, &skip).await;
    let body = if accepted { "true" } else { "false" };
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}

/// PEM armor of this node's signing identity.
async fn public_key(State(state): State<Arc<GatewayState>>) -> Response {
    (
        [(header::CONTENT_TYPE, "application/x-pem-file")],
        state.identity.public_pem().to_owned(),
    )
        .into_response()
}

/// User-facing errors surface with their message; everything else is logged
/// and masked.
fn error_response(err: Error) -> Response {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if err.is_user_facing() {
        (status, Json(serde_json::json!({ "message": err.to_string() }))).into_response()
    } else {
        error!(error = %err, "gateway request failed");
        (
            status,
            Json(serde_json::json!({ "message": "internal server error" })),
        )
            .into_response()
    }
}

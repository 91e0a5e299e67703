//! Signed outbound HTTP to other nodes.

use {reqwest::header::AUTHORIZATION, serde::Serialize, tracing::debug};

use {
    spherical_auth::UserContext,
    spherical_common::{Error, Result},
    spherical_hashverifier::CrossNodeMessage,
};

use crate::state::GatewayState;

/// POST a cross-node-signed envelope to `path` on another node, carrying the
/// (redacted) user context in the authorization header.
pub async fn send_cross_node_message<T: Serialize>(
    state: &GatewayState,
    recv_hostname: &str,
    path: &str,
    data: &T,
    user: &UserContext,
) -> Result<reqwest::Response> {
    let self_hostname = state.hostname();
    if recv_hostname.eq_ignore_ascii_case(&self_hostname) {
        return Err(Error::invalid("cannot send cross node message to ourselves"));
    }

    let message = CrossNodeMessage::new(data, &self_hostname, &state.identity)?;
    let url = format!("{}://{}{}", state.http_scheme, recv_hostname, path);
    debug!(url = %url, "sending cross-node message");

    state
        .http
        .post(&url)
        .header(AUTHORIZATION, user.to_auth_header()?)
        .json(&message)
        .send()
        .await
        .map_err(Error::transient)
}

/// Exchange a signed request for a single-use node-auth token on the remote
/// node, suitable for an immediate gateway Hello.
pub async fn fetch_cross_node_token(
    state: &GatewayState,
    host: &str,
    user: &UserContext,
) -> Result<String> {
    let response = send_cross_node_message(
        state,
        host,
        "/api/v1/gateway/cross_node",
        &serde_json::json!({}),
        user,
    )
    .await?;

    if !response.status().is_success() {
        return Err(Error::transient_msg(format!(
            "token exchange with {host} failed: status {}",
            response.status()
        )));
    }
    response.json::<String>().await.map_err(Error::transient)
}

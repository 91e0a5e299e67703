//! One client socket, from upgrade to teardown.
//!
//! awaiting-hello → authenticated → discovering-guilds → ready → running →
//! closed. Writes are serialized by the per-socket writer lock; reads are
//! serial by protocol.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use {
    axum::extract::ws::{CloseFrame, Message, WebSocket},
    futures::{
        SinkExt, StreamExt,
        stream::{SplitSink, SplitStream},
    },
    tokio::sync::{Mutex, mpsc},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use {
    spherical_auth::{UserContext, sessions},
    spherical_common::{Error, Result},
    spherical_protocol::{
        AcceptedPayload, DisconnectPayload, Guild, GuildUpdatePayload, HEARTBEAT_INTERVAL_MS,
        HEARTBEAT_TIMEOUT_MS, HELLO_TIMEOUT_MS, HeartbeatPayload, HelloPayload, JoinGuildPayload,
        Payload, ReadyPayload, close_codes,
    },
};

use crate::{
    codec::{FrameDecoder, FrameEncoder},
    cross_node_client::CrossNodeClient,
    discovery,
    heartbeat::HeartbeatRegistry,
    state::GatewayState,
};

/// Write half of the client socket plus its compression context. All sends
/// go through one lock.
pub struct SocketWriter {
    sink: SplitSink<WebSocket, Message>,
    encoder: FrameEncoder,
}

impl SocketWriter {
    async fn send(&mut self, payload: &Payload) -> Result<()> {
        let frame = self.encoder.encode(payload)?;
        self.sink
            .send(Message::Binary(frame.into()))
            .await
            .map_err(Error::transient)
    }

    async fn send_close(&mut self, payload: &DisconnectPayload, code: u16) {
        let frame = CloseFrame {
            code,
            reason: payload.to_close_reason().into(),
        };
        let _ = self.sink.send(Message::Close(Some(frame))).await;
    }
}

pub struct ClientConnection {
    pub conn_id: String,
    pub user: UserContext,
    /// Authenticated via a node-auth token rather than a local session.
    cross_node: bool,
    writer: Arc<Mutex<SocketWriter>>,
    heartbeats: HeartbeatRegistry,
    remotes: Mutex<HashMap<String, Arc<CrossNodeClient>>>,
    hooks: StdMutex<Vec<Box<dyn FnOnce() + Send>>>,
    cancel: CancellationToken,
}

impl ClientConnection {
    /// Send the JSON disconnect close frame and stop every loop.
    pub async fn disconnect(&self, reason: &str, reconnect: bool, code: u16) {
        let payload = DisconnectPayload::new(reason, reconnect);
        self.writer.lock().await.send_close(&payload, code).await;
        self.cancel.cancel();
    }

    fn add_hook<F: FnOnce() + Send + 'static>(&self, hook: F) {
        self.hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(hook));
    }

    async fn adopt_remote(&self, client: Arc<CrossNodeClient>) {
        self.remotes
            .lock()
            .await
            .insert(client.host.clone(), Arc::clone(&client));
        self.add_hook(move || {
            tokio::spawn(async move {
                client.shutdown().await;
            });
        });
    }

    /// Run the disconnect-hook stack (LIFO) and cancel timers.
    async fn teardown(&self) {
        self.cancel.cancel();
        self.heartbeats.clear();
        let hooks: Vec<_> = {
            let mut hooks = self.hooks.lock().unwrap_or_else(|e| e.into_inner());
            hooks.drain(..).rev().collect()
        };
        for hook in hooks {
            hook();
        }
        self.remotes.lock().await.clear();
    }
}

/// Handle a freshly upgraded gateway socket through its full lifecycle.
pub async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>, compress: bool) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, compress, "gateway: new connection");

    let (sink, mut source) = socket.split();
    let writer = Arc::new(Mutex::new(SocketWriter {
        sink,
        encoder: FrameEncoder::new(compress),
    }));
    let mut decoder = FrameDecoder::new(compress);

    // ── Hello ───────────────────────────────────────────────────────────

    let hello = tokio::time::timeout(
        Duration::from_millis(HELLO_TIMEOUT_MS),
        read_frame(&mut source, &mut decoder),
    )
    .await;
    let hello = match hello {
        Ok(Ok(Some(Payload::Hello(hello)))) => hello,
        Ok(Ok(_)) | Ok(Err(_)) | Err(_) => {
            warn!(conn_id = %conn_id, "gateway: hello not sent first");
            writer
                .lock()
                .await
                .send_close(
                    &DisconnectPayload::new("hello payload was not sent first", false),
                    close_codes::INVALID_PAYLOAD,
                )
                .await;
            return;
        },
    };

    // ── Authentication ──────────────────────────────────────────────────

    let user = match authenticate(&state, &hello).await {
        Ok(user) => user,
        Err(e) => {
            let (payload, code) = auth_failure(hello.cross_node, &e);
            warn!(conn_id = %conn_id, error = %e, "gateway: auth failed");
            writer.lock().await.send_close(&payload, code).await;
            return;
        },
    };
    info!(conn_id = %conn_id, user_id = user.user_id, hostname = %user.hostname,
        cross_node = hello.cross_node, "gateway: authenticated");

    let conn = Arc::new(ClientConnection {
        conn_id: conn_id.clone(),
        user,
        cross_node: hello.cross_node,
        writer: Arc::clone(&writer),
        heartbeats: HeartbeatRegistry::new(),
        remotes: Mutex::new(HashMap::new()),
        hooks: StdMutex::new(Vec::new()),
        cancel: CancellationToken::new(),
    });

    // ── Accepted ────────────────────────────────────────────────────────

    let accepted = Payload::Accepted(AcceptedPayload {
        heartbeat_interval: HEARTBEAT_INTERVAL_MS,
    });
    if writer.lock().await.send(&accepted).await.is_err() {
        return;
    }

    // ── Guild discovery and Ready ───────────────────────────────────────

    let (updates_tx, updates_rx) = mpsc::channel::<Payload>(32);
    let ready = run_discovery(&state, &conn, updates_tx).await;
    if writer.lock().await.send(&Payload::Ready(ready)).await.is_err() {
        conn.teardown().await;
        return;
    }
    spawn_update_forwarder(&conn, updates_rx);
    spawn_heartbeat_loop(&conn);

    // ── Read loop ───────────────────────────────────────────────────────

    loop {
        let frame = tokio::select! {
            () = conn.cancel.cancelled() => break,
            frame = read_frame(&mut source, &mut decoder) => frame,
        };
        match frame {
            Ok(Some(Payload::Heartbeat(hb))) => {
                if !conn.heartbeats.beat(&hb.id) {
                    debug!(conn_id = %conn_id, id = %hb.id, "gateway: unsolicited heartbeat");
                }
            },
            Ok(Some(Payload::JoinGuild(join))) => handle_join(&state, &conn, join).await,
            Ok(Some(other)) => {
                debug!(conn_id = %conn_id, tag = other.tag(), "gateway: ignoring payload");
            },
            Ok(None) => break,
            Err(e) => {
                debug!(conn_id = %conn_id, error = %e, "gateway: read failed");
                break;
            },
        }
    }

    conn.teardown().await;
    info!(conn_id = %conn_id, "gateway: connection closed");
}

async fn authenticate(state: &GatewayState, hello: &HelloPayload) -> Result<UserContext> {
    if hello.cross_node {
        // Single-use: the fetch consumes the token under its advisory lock.
        let bytes = state.tokens.get_cross_node_token(&hello.token).await?;
        rmp_serde::from_slice(&bytes).map_err(Error::internal)
    } else {
        let mut user = sessions::user_from_token(&state.pool, &hello.token).await?;
        user.hostname = state.hostname();
        Ok(user)
    }
}

/// Map an authentication failure to the disconnect the client sees. Invalid
/// credentials mean "do not retry"; anything else is transient.
fn auth_failure(cross_node: bool, err: &Error) -> (DisconnectPayload, u16) {
    match err {
        Error::NotFound(_) | Error::Unauthorized(_) if cross_node => (
            DisconnectPayload::new("invalid cross node token", true),
            close_codes::INVALID_PAYLOAD,
        ),
        Error::NotFound(_) | Error::Unauthorized(_) => (
            DisconnectPayload::new("invalid token", false),
            close_codes::INVALID_PAYLOAD,
        ),
        _ => (
            DisconnectPayload::new("internal server error", true),
            close_codes::INTERNAL,
        ),
    }
}

async fn run_discovery(
    state: &Arc<GatewayState>,
    conn: &Arc<ClientConnection>,
    updates_tx: mpsc::Sender<Payload>,
) -> ReadyPayload {
    let self_hostname = state.hostname();
    let memberships =
        match spherical_db::guilds::member_guilds(&state.pool, &conn.user.hostname, conn.user.user_id)
            .await
        {
            Ok(memberships) => memberships,
            Err(e) => {
                warn!(conn_id = %conn.conn_id, error = %e, "gateway: membership query failed");
                Vec::new()
            },
        };

    let mut available = Vec::new();
    let mut unavailable = Vec::new();
    let mut remote_dials = Vec::new();

    for (host, expected) in discovery::partition_by_host(memberships) {
        if host == self_hostname {
            load_local_guilds(state, &expected, &mut available, &mut unavailable).await;
        } else if conn.cross_node {
            // The user's home node does the fan-out; a cross-node socket
            // reports local guilds only.
            debug!(conn_id = %conn.conn_id, host = %host,
                "gateway: skipping remote partition on cross-node socket");
        } else {
            remote_dials.push(discovery::discover_remote(
                state.as_ref(),
                &conn.user,
                host,
                expected,
                updates_tx.clone(),
            ));
        }
    }

    for outcome in futures::future::join_all(remote_dials).await {
        available.extend(outcome.available);
        unavailable.extend(outcome.unavailable);
        if let Some(client) = outcome.client {
            conn.adopt_remote(Arc::clone(&client)).await;
            if outcome.ready_pending {
                spawn_late_ready(conn, client, outcome.host, outcome.expected);
            }
        }
    }

    ReadyPayload {
        available_guilds: available,
        unavailable_guilds: unavailable,
    }
}

async fn load_local_guilds(
    state: &GatewayState,
    expected: &[u64],
    available: &mut Vec<Guild>,
    unavailable: &mut Vec<Guild>,
) {
    let self_hostname = state.hostname();
    match spherical_db::guilds::load_guilds(&state.pool, expected).await {
        Ok(mut guilds) => {
            let found: HashSet<u64> = guilds.iter().map(|g| g.id).collect();
            for guild in &mut guilds {
                guild.hostname = self_hostname.clone();
            }
            available.extend(guilds);
            unavailable.extend(
                expected
                    .iter()
                    .filter(|id| !found.contains(id))
                    .map(|id| Guild::unavailable(*id, &self_hostname)),
            );
        },
        Err(e) => {
            warn!(error = %e, "gateway: local guild load failed");
            unavailable.extend(discovery::all_unavailable(&self_hostname, expected));
        },
    }
}

/// A remote's Ready that missed the discovery budget is still honored: its
/// guilds are streamed as GuildUpdate frames on the original socket.
fn spawn_late_ready(
    conn: &Arc<ClientConnection>,
    client: Arc<CrossNodeClient>,
    host: String,
    expected: Vec<u64>,
) {
    let writer = Arc::clone(&conn.writer);
    tokio::spawn(async move {
        let Ok(ready) = client.wait_ready().await else {
            return;
        };
        let (available, _) = discovery::merge_remote_ready(&host, &expected, &ready);
        info!(host = %host, count = available.len(), "gateway: honoring late ready");
        for guild in available {
            let update = Payload::GuildUpdate(GuildUpdatePayload { guild });
            if writer.lock().await.send(&update).await.is_err() {
                return;
            }
        }
    });
}

/// Forward updates posted by cross-node clients to the client socket.
fn spawn_update_forwarder(conn: &Arc<ClientConnection>, mut updates: mpsc::Receiver<Payload>) {
    let writer = Arc::clone(&conn.writer);
    let cancel = conn.cancel.clone();
    tokio::spawn(async move {
        loop {
            let payload = tokio::select! {
                () = cancel.cancelled() => return,
                payload = updates.recv() => payload,
            };
            let Some(payload) = payload else { return };
            if writer.lock().await.send(&payload).await.is_err() {
                return;
            }
        }
    });
}

/// Every 2 s: fresh heartbeat id, send, arm the 2x-interval disarm timer.
/// Expiry closes the socket as timed out.
fn spawn_heartbeat_loop(conn: &Arc<ClientConnection>) {
    let conn = Arc::clone(conn);
    tokio::spawn(async move {
        let interval = Duration::from_millis(HEARTBEAT_INTERVAL_MS);
        loop {
            tokio::select! {
                () = conn.cancel.cancelled() => return,
                () = tokio::time::sleep(interval) => {},
            }

            let id = uuid::Uuid::new_v4().to_string();
            let expired = Arc::clone(&conn);
            conn.heartbeats
                .arm(&id, Duration::from_millis(HEARTBEAT_TIMEOUT_MS), move || {
                    tokio::spawn(async move {
                        expired
                            .disconnect("connection timed out", true, close_codes::GOING_AWAY)
                            .await;
                    });
                });

            let beat = Payload::Heartbeat(HeartbeatPayload { id });
            if conn.writer.lock().await.send(&beat).await.is_err() {
                conn.cancel.cancel();
                return;
            }
        }
    });
}

/// Joins for remote guilds are relayed over the matching cross-node socket;
/// local joins belong to the invite HTTP surface.
async fn handle_join(state: &GatewayState, conn: &Arc<ClientConnection>, join: JoinGuildPayload) {
    let self_hostname = state.hostname();
    if join.hostname.is_empty() || join.hostname == self_hostname {
        debug!(conn_id = %conn.conn_id, "gateway: local join handled elsewhere");
        return;
    }
    let client = conn.remotes.lock().await.get(&join.hostname).cloned();
    match client {
        Some(client) => {
            let forwarded = Payload::JoinGuild(JoinGuildPayload {
                hostname: String::new(),
                ..join
            });
            if let Err(e) = client.send(&forwarded).await {
                warn!(conn_id = %conn.conn_id, host = %client.host, error = %e,
                    "gateway: join relay failed");
            }
        },
        None => debug!(conn_id = %conn.conn_id, host = %join.hostname,
            "gateway: join for a host we hold no socket to"),
    }
}

async fn read_frame(
    source: &mut SplitStream<WebSocket>,
    decoder: &mut FrameDecoder,
) -> Result<Option<Payload>> {
    while let Some(message) = source.next().await {
        match message.map_err(Error::transient)? {
            Message::Binary(bytes) => return decoder.decode(&bytes).map(Some),
            Message::Close(_) => return Ok(None),
            Message::Text(_) => return Err(Error::invalid("text frames are not part of the protocol")),
            _ => continue,
        }
    }
    Ok(None)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failure_mapping() {
        let (payload, code) = auth_failure(false, &Error::not_found("session token"));
        assert_eq!(payload.reason, "invalid token");
        assert!(!payload.reconnect);
        assert_eq!(code, close_codes::INVALID_PAYLOAD);

        // A missing cross-node token may simply have expired in transit;
        // the home node can mint a new one.
        let (payload, code) = auth_failure(true, &Error::not_found("cross-node token"));
        assert_eq!(payload.reason, "invalid cross node token");
        assert!(payload.reconnect);
        assert_eq!(code, close_codes::INVALID_PAYLOAD);

        let (payload, code) = auth_failure(true, &Error::transient_msg("redis down"));
        assert_eq!(payload.reason, "internal server error");
        assert!(payload.reconnect);
        assert_eq!(code, close_codes::INTERNAL);
    }
}

//! The WebSocket client one node opens against another to relay its user's
//! remote guild state.
//!
//! After Hello/Accepted the client exposes a latch on Ready: the first Ready
//! satisfies every waiter, however late they register. Heartbeats from the
//! remote are echoed back (the remote drives the cadence); guild updates are
//! posted on a channel owned by the parent connection, which keeps the
//! parent↔client reference one-way.

use std::sync::{Arc, Mutex as StdMutex};

use {
    futures::{
        SinkExt, StreamExt,
        stream::{SplitSink, SplitStream},
    },
    tokio::{
        net::TcpStream,
        sync::{Mutex, mpsc, oneshot},
    },
    tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite},
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use {
    spherical_common::{Error, Result},
    spherical_protocol::{HELLO_TIMEOUT_MS, HelloPayload, Payload, ReadyPayload},
};

use crate::{
    codec::{FrameDecoder, FrameEncoder},
    state::GatewayState,
};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, tungstenite::Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

struct Writer {
    sink: WsSink,
    encoder: FrameEncoder,
}

impl Writer {
    async fn send(&mut self, payload: &Payload) -> Result<()> {
        let frame = self.encoder.encode(payload)?;
        self.sink
            .send(tungstenite::Message::Binary(frame.into()))
            .await
            .map_err(Error::transient)
    }
}

/// Error messages are latched as strings so every waiter can observe them.
type ReadyOutcome = std::result::Result<ReadyPayload, String>;

enum LatchState {
    Pending(Vec<oneshot::Sender<ReadyOutcome>>),
    Done(ReadyOutcome),
}

/// One-shot latch: resolved exactly once, observable any number of times.
struct ReadyLatch {
    state: StdMutex<LatchState>,
}

impl ReadyLatch {
    fn new() -> Self {
        Self {
            state: StdMutex::new(LatchState::Pending(Vec::new())),
        }
    }

    async fn wait(&self) -> Result<ReadyPayload> {
        let rx = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match &mut *state {
                LatchState::Done(outcome) => return outcome.clone().map_err(Error::transient_msg),
                LatchState::Pending(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                },
            }
        };
        match rx.await {
            Ok(outcome) => outcome.map_err(Error::transient_msg),
            Err(_) => Err(Error::transient_msg("cross-node client went away")),
        }
    }

    fn resolve(&self, outcome: ReadyOutcome) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let waiters = match &mut *state {
            // Already latched; a second Ready is a dodgy packet.
            LatchState::Done(_) => return,
            LatchState::Pending(waiters) => std::mem::take(waiters),
        };
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        *state = LatchState::Done(outcome);
    }
}

pub struct CrossNodeClient {
    pub host: String,
    writer: Mutex<Writer>,
    ready: ReadyLatch,
    destructors: StdMutex<Vec<Box<dyn FnOnce() + Send>>>,
    cancel: CancellationToken,
}

impl CrossNodeClient {
    /// Dial `host`, authenticate with the node-auth `token`, and wait for
    /// Accepted. Remote updates are forwarded on `updates`.
    pub async fn connect(
        state: &GatewayState,
        host: &str,
        token: &str,
        updates: mpsc::Sender<Payload>,
    ) -> Result<Arc<Self>> {
        let url = format!(
            "{}://{}/api/v1/gateway?compress=zlib-stream",
            state.ws_scheme, host
        );
        let (stream, _) = connect_async(url.as_str()).await.map_err(Error::transient)?;
        let (sink, mut source) = stream.split();
        let mut writer = Writer {
            sink,
            encoder: FrameEncoder::new(true),
        };
        let mut decoder = FrameDecoder::new(true);

        writer
            .send(&Payload::Hello(HelloPayload {
                token: token.to_owned(),
                cross_node: true,
            }))
            .await?;

        let accepted = tokio::time::timeout(
            std::time::Duration::from_millis(HELLO_TIMEOUT_MS),
            read_frame(&mut source, &mut decoder),
        )
        .await
        .map_err(|_| Error::transient_msg(format!("{host} did not accept in time")))??;
        match accepted {
            Some(Payload::Accepted(_)) => {},
            Some(_) => {
                return Err(Error::invalid(format!("{host} sent a non-accepted frame first")));
            },
            None => return Err(Error::transient_msg(format!("{host} closed during handshake"))),
        }

        let client = Arc::new(Self {
            host: host.to_owned(),
            writer: Mutex::new(writer),
            ready: ReadyLatch::new(),
            destructors: StdMutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        });

        let reader = Arc::clone(&client);
        tokio::spawn(async move {
            reader.read_loop(source, decoder, updates).await;
        });
        Ok(client)
    }

    /// Wait for the remote's Ready. The first Ready satisfies every waiter;
    /// registering after it arrived returns the cached result immediately.
    pub async fn wait_ready(&self) -> Result<ReadyPayload> {
        self.ready.wait().await
    }

    /// Relay a payload to the remote (e.g. a forwarded guild join).
    pub async fn send(&self, payload: &Payload) -> Result<()> {
        self.writer.lock().await.send(payload).await
    }

    /// Register teardown work run when the socket dies.
    pub fn add_destructor<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.destructors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(f));
    }

    /// Tear the client down from the parent side.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut writer = self.writer.lock().await;
        let _ = writer.sink.close().await;
    }

    async fn read_loop(
        self: Arc<Self>,
        mut source: WsSource,
        mut decoder: FrameDecoder,
        updates: mpsc::Sender<Payload>,
    ) {
        loop {
            let frame = tokio::select! {
                () = self.cancel.cancelled() => break,
                frame = read_frame(&mut source, &mut decoder) => frame,
            };
            let payload = match frame {
                Ok(Some(payload)) => payload,
                Ok(None) => break,
                Err(e) => {
                    warn!(host = %self.host, error = %e, "cross-node read failed");
                    break;
                },
            };

            match payload {
                Payload::Heartbeat(hb) => {
                    // The remote drives the cadence; echo the same id back.
                    let echo = Payload::Heartbeat(hb);
                    if self.writer.lock().await.send(&echo).await.is_err() {
                        break;
                    }
                },
                Payload::Ready(ready) => self.ready.resolve(Ok(ready)),
                Payload::GuildUpdate(mut update) => {
                    // Stamp the owning node before it reaches the client.
                    update.guild.hostname = self.host.clone();
                    let _ = updates.send(Payload::GuildUpdate(update)).await;
                },
                other => debug!(host = %self.host, tag = other.tag(), "ignoring payload"),
            }
        }

        self.ready
            .resolve(Err(format!("connection to {} closed", self.host)));
        let destructors: Vec<_> = {
            let mut destructors = self.destructors.lock().unwrap_or_else(|e| e.into_inner());
            destructors.drain(..).rev().collect()
        };
        for destructor in destructors {
            destructor();
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.sink.close().await;
        debug!(host = %self.host, "cross-node client closed");
    }
}

async fn read_frame(source: &mut WsSource, decoder: &mut FrameDecoder) -> Result<Option<Payload>> {
    while let Some(message) = source.next().await {
        match message.map_err(Error::transient)? {
            tungstenite::Message::Binary(bytes) => return decoder.decode(&bytes).map(Some),
            tungstenite::Message::Close(_) => return Ok(None),
            _ => continue,
        }
    }
    Ok(None)
}

//! Table-scoped and generic pub/sub over the broker.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    futures::StreamExt,
    serde::{Deserialize, Serialize},
    tokio::sync::{Mutex, RwLock, mpsc},
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use spherical_common::{Error, Result};

use crate::{broker::Broker, ignore::IgnoreSet};

/// Channel that carries every table edit envelope.
pub const TABLE_UPDATE_CHANNEL: &str = "table-update";

/// Per-subscriber buffer; a consumer this far behind starts losing
/// non-blocking dispatches.
const SUBSCRIBER_BUFFER: usize = 16;

fn generic_channel(name: &str) -> String {
    format!("generic-event:{name}")
}

#[derive(Debug, Serialize, Deserialize)]
struct TableEnvelope {
    i: u64,
    t: String,
    m: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct GenericEnvelope {
    i: u64,
    d: Vec<u8>,
}

struct GenericEntry {
    consumers: Vec<(u64, mpsc::Sender<Vec<u8>>)>,
    cancel: CancellationToken,
}

pub struct EventBus {
    broker: Arc<Broker>,
    ignore: IgnoreSet,
    tables: RwLock<HashMap<String, Vec<mpsc::Sender<serde_json::Value>>>>,
    generic: Mutex<HashMap<String, GenericEntry>>,
    consumer_ids: AtomicU64,
    cancel: CancellationToken,
}

impl EventBus {
    #[must_use]
    pub fn new(broker: Arc<Broker>) -> Arc<Self> {
        Arc::new(Self {
            broker,
            ignore: IgnoreSet::new(),
            tables: RwLock::new(HashMap::new()),
            generic: Mutex::new(HashMap::new()),
            consumer_ids: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        })
    }

    /// Start the `table-update` watcher loop.
    pub fn start(self: &Arc<Self>) {
        let bus = Arc::clone(self);
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            bus.subscriber_loop(Subscription::TableUpdates, cancel).await;
        });
    }

    /// Cancel every subscriber loop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    // ── Table-scoped edits ──────────────────────────────────────────────

    /// Run the database write, publish its envelope on the broker, then
    /// dispatch to in-process subscribers. The local dispatch blocks, so any
    /// in-process subscriber has observed the change before this returns;
    /// remote subscribers are eventually consistent.
    pub async fn edit_and_publish<F, Fut, M>(&self, table: &str, commit: F, metadata: M) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
        M: Serialize,
    {
        let metadata = serde_json::to_value(metadata).map_err(Error::internal)?;
        let id = self.ignore.next();
        let envelope = TableEnvelope {
            i: id,
            t: table.to_owned(),
            m: metadata.clone(),
        };
        let bytes = serde_json::to_vec(&envelope).map_err(Error::internal)?;

        if let Err(e) = commit().await {
            self.ignore.consume(id);
            return Err(e);
        }
        if let Err(e) = self.broker.publish(TABLE_UPDATE_CHANNEL, bytes).await {
            self.ignore.consume(id);
            return Err(e);
        }

        self.dispatch_table(table, &metadata, true).await;
        Ok(())
    }

    /// Subscribe to a table's edit metadata.
    pub async fn subscribe_table(&self, table: &str) -> mpsc::Receiver<serde_json::Value> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.tables
            .write()
            .await
            .entry(table.to_owned())
            .or_default()
            .push(tx);
        rx
    }

    /// Typed convenience: decode each envelope into `T` and hand it to `f`.
    /// Envelopes that do not decode are dropped.
    pub async fn add_table_watcher<T, F>(&self, table: &str, f: F)
    where
        T: for<'de> Deserialize<'de> + Send + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let mut rx = self.subscribe_table(table).await;
        tokio::spawn(async move {
            while let Some(value) = rx.recv().await {
                match serde_json::from_value::<T>(value) {
                    Ok(decoded) => f(decoded),
                    Err(e) => debug!(error = %e, "table watcher dropped undecodable metadata"),
                }
            }
        });
    }

    pub(crate) async fn ingest_table_update(&self, bytes: &[u8]) {
        let envelope: TableEnvelope = match serde_json::from_slice(bytes) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "table-update envelope failed to parse");
                return;
            },
        };
        // Our own publish coming back around: drop it, the blocking dispatch
        // already ran.
        if self.ignore.consume(envelope.i) {
            return;
        }
        self.dispatch_table(&envelope.t, &envelope.m, false).await;
    }

    async fn dispatch_table(&self, table: &str, metadata: &serde_json::Value, blocking: bool) {
        let senders = {
            let tables = self.tables.read().await;
            match tables.get(table) {
                Some(senders) => senders.clone(),
                None => return,
            }
        };
        for tx in senders {
            if blocking {
                let _ = tx.send(metadata.clone()).await;
            } else {
                // Drop on slow consumer.
                let _ = tx.try_send(metadata.clone());
            }
        }
    }

    // ── Generic events ──────────────────────────────────────────────────

    /// Register a consumer for a named event. The first consumer per name
    /// starts a dedicated subscriber loop on `generic-event:<name>`;
    /// unsubscribing the last one cancels it.
    pub async fn add_generic_event_handler<F>(
        self: &Arc<Self>,
        name: &str,
        f: F,
    ) -> GenericSubscription
    where
        F: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        let id = self.consumer_ids.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(SUBSCRIBER_BUFFER);
        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                f(bytes);
            }
        });

        let mut generic = self.generic.lock().await;
        let entry = generic.entry(name.to_owned()).or_insert_with(|| {
            let cancel = self.cancel.child_token();
            let bus = Arc::clone(self);
            let event = name.to_owned();
            let loop_cancel = cancel.clone();
            tokio::spawn(async move {
                bus.subscriber_loop(Subscription::Generic(event), loop_cancel)
                    .await;
            });
            GenericEntry {
                consumers: Vec::new(),
                cancel,
            }
        });
        entry.consumers.push((id, tx));

        GenericSubscription {
            bus: Arc::clone(self),
            name: name.to_owned(),
            id,
        }
    }

    /// Publish a named event on the broker and to local consumers. The local
    /// echo from the broker is suppressed via the ignore set.
    pub async fn publish_generic(&self, name: &str, data: Vec<u8>) -> Result<()> {
        let id = self.ignore.next();
        let envelope = GenericEnvelope { i: id, d: data };
        let bytes =
            rmp_serde::to_vec_named(&envelope).map_err(Error::internal)?;
        if let Err(e) = self.broker.publish(&generic_channel(name), bytes).await {
            self.ignore.consume(id);
            return Err(e);
        }
        self.fan_generic(name, &envelope.d).await;
        Ok(())
    }

    pub(crate) async fn ingest_generic(&self, name: &str, bytes: &[u8]) {
        let envelope: GenericEnvelope = match rmp_serde::from_slice(bytes) {
            Ok(e) => e,
            Err(e) => {
                warn!(event = name, error = %e, "generic envelope failed to parse");
                return;
            },
        };
        if self.ignore.consume(envelope.i) {
            return;
        }
        self.fan_generic(name, &envelope.d).await;
    }

    async fn fan_generic(&self, name: &str, data: &[u8]) {
        let consumers = {
            let generic = self.generic.lock().await;
            match generic.get(name) {
                Some(entry) => entry.consumers.clone(),
                None => return,
            }
        };
        for (_, tx) in consumers {
            let _ = tx.try_send(data.to_vec());
        }
    }

    async fn remove_generic_consumer(&self, name: &str, id: u64) {
        let mut generic = self.generic.lock().await;
        if let Some(entry) = generic.get_mut(name) {
            entry.consumers.retain(|(cid, _)| *cid != id);
            if entry.consumers.is_empty() {
                entry.cancel.cancel();
                generic.remove(name);
            }
        }
    }

    // ── Subscriber loops ────────────────────────────────────────────────

    /// Shared reconnect loop: additive back-off of 10 ms per consecutive
    /// failure, capped at 10 minutes (on reaching the cap it resets to
    /// 10 ms). Cancellation exits cleanly without an error log.
    async fn subscriber_loop(self: Arc<Self>, subscription: Subscription, cancel: CancellationToken) {
        let channel = subscription.channel();
        let mut backoff = Duration::ZERO;
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let mut pubsub = match self.broker.pubsub().await {
                Ok(p) => p,
                Err(e) => {
                    let wait = bump_backoff(&mut backoff);
                    warn!(channel = %channel, error = %e, backoff_ms = wait.as_millis() as u64,
                        "broker subscribe failed, backing off");
                    if sleep_or_cancel(wait, &cancel).await {
                        return;
                    }
                    continue;
                },
            };
            if let Err(e) = pubsub.subscribe(&channel).await {
                let wait = bump_backoff(&mut backoff);
                warn!(channel = %channel, error = %e, backoff_ms = wait.as_millis() as u64,
                    "broker subscribe failed, backing off");
                if sleep_or_cancel(wait, &cancel).await {
                    return;
                }
                continue;
            }

            debug!(channel = %channel, "broker subscriber attached");
            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    msg = stream.next() => match msg {
                        Some(msg) => {
                            backoff = Duration::ZERO;
                            let bytes = msg.get_payload_bytes().to_vec();
                            match &subscription {
                                Subscription::TableUpdates => {
                                    self.ingest_table_update(&bytes).await;
                                },
                                Subscription::Generic(event) => {
                                    self.ingest_generic(event, &bytes).await;
                                },
                            }
                        },
                        None => {
                            let wait = bump_backoff(&mut backoff);
                            warn!(channel = %channel, backoff_ms = wait.as_millis() as u64,
                                "broker subscription dropped, backing off");
                            break;
                        },
                    },
                }
            }
            drop(stream);

            if sleep_or_cancel(backoff, &cancel).await {
                return;
            }
        }
    }
}

/// What a subscriber loop feeds on.
enum Subscription {
    TableUpdates,
    Generic(String),
}

impl Subscription {
    fn channel(&self) -> String {
        match self {
            Self::TableUpdates => TABLE_UPDATE_CHANNEL.to_owned(),
            Self::Generic(event) => generic_channel(event),
        }
    }
}

fn bump_backoff(backoff: &mut Duration) -> Duration {
    *backoff += Duration::from_millis(10);
    if *backoff > Duration::from_secs(600) {
        *backoff = Duration::from_millis(10);
    }
    *backoff
}

/// Returns true when cancelled.
async fn sleep_or_cancel(wait: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => true,
        () = tokio::time::sleep(wait) => false,
    }
}

/// Handle returned by [`EventBus::add_generic_event_handler`]; consume it to
/// unsubscribe.
pub struct GenericSubscription {
    bus: Arc<EventBus>,
    name: String,
    id: u64,
}

impl GenericSubscription {
    pub async fn unsubscribe(self) {
        self.bus.remove_generic_consumer(&self.name, self.id).await;
    }
}

//! Replaceable handle to the KV-channel broker.
//!
//! The connection may be swapped at runtime (reconnection is the one
//! permitted post-startup mutation), so every consumer reads it through the
//! lock before use.

use {
    redis::{AsyncCommands, Client, aio::ConnectionManager},
    tokio::sync::RwLock,
    tracing::info,
};

use spherical_common::{Error, Result};

pub struct Broker {
    client: RwLock<Client>,
    manager: RwLock<Option<ConnectionManager>>,
}

impl Broker {
    /// Parse the URL without dialling. The first command establishes the
    /// connection.
    pub fn new(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(Error::transient)?;
        Ok(Self {
            client: RwLock::new(client),
            manager: RwLock::new(None),
        })
    }

    /// Parse and dial eagerly, so startup fails fast on a bad broker.
    pub async fn connect(url: &str) -> Result<Self> {
        let broker = Self::new(url)?;
        broker.manager().await?;
        Ok(broker)
    }

    /// Replace the underlying connection.
    pub async fn reconnect(&self, url: &str) -> Result<()> {
        let client = Client::open(url).map_err(Error::transient)?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(Error::transient)?;
        *self.client.write().await = client;
        *self.manager.write().await = Some(manager);
        info!("broker connection replaced");
        Ok(())
    }

    /// A multiplexed command connection (cheap to clone).
    pub async fn manager(&self) -> Result<ConnectionManager> {
        if let Some(manager) = self.manager.read().await.clone() {
            return Ok(manager);
        }
        let mut slot = self.manager.write().await;
        if let Some(manager) = slot.clone() {
            return Ok(manager);
        }
        let client = self.client.read().await.clone();
        let manager = client
            .get_connection_manager()
            .await
            .map_err(Error::transient)?;
        *slot = Some(manager.clone());
        Ok(manager)
    }

    pub async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        let mut conn = self.manager().await?;
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(Error::transient)
    }

    /// A fresh pub/sub connection. Subscriber loops hold one each and rebuild
    /// it on failure.
    pub async fn pubsub(&self) -> Result<redis::aio::PubSub> {
        let client = self.client.read().await.clone();
        client.get_async_pubsub().await.map_err(Error::transient)
    }
}

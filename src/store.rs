use parking_lot::RwLock;
use redis::aio::{ConnectionManager, PubSub};
use redis::Client;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::SessionError;

/// Store connection shared by a manager and every session it hands out.
///
/// `ConnectionManager` multiplexes requests and reconnects on its own, so clones are
/// handed to each call. Closing the slot makes every holder fail with `Closed` and ends
/// every open subscription.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<RwLock<Option<Connected>>>,
    closed: Arc<watch::Sender<bool>>,
}

#[derive(Clone)]
struct Connected {
    client: Client,
    conn: ConnectionManager,
}

impl StoreHandle {
    pub async fn connect(redis_url: &str) -> Result<Self, SessionError> {
        let client = Client::open(redis_url)?;
        let conn = ConnectionManager::new(client.clone()).await?;

        Ok(Self {
            inner: Arc::new(RwLock::new(Some(Connected { client, conn }))),
            closed: Arc::new(watch::Sender::new(false)),
        })
    }

    pub fn conn(&self) -> Result<ConnectionManager, SessionError> {
        self.inner
            .read()
            .as_ref()
            .map(|c| c.conn.clone())
            .ok_or(SessionError::Closed)
    }

    /// Open a dedicated connection for subscriptions.
    pub async fn pubsub(&self) -> Result<PubSub, SessionError> {
        let client = self
            .inner
            .read()
            .as_ref()
            .map(|c| c.client.clone())
            .ok_or(SessionError::Closed)?;

        Ok(client.get_async_pubsub().await?)
    }

    /// Flips to `true` when the slot is closed.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    pub fn close(&self) {
        self.inner.write().take();
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.read().is_none()
    }
}

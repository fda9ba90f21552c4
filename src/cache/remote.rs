use super::backoff::Backoff;
use super::resp::{RedisAddress, RespConnection, RespValue};
use super::ResultCache;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// How often an idle connection is checked for a server-side close.
const LIVENESS_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct RemoteCacheOptions {
    pub key_prefix: String,
    pub operation_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
}

struct Inner {
    address: RedisAddress,
    options: RemoteCacheOptions,
    connection: Mutex<Option<RespConnection>>,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
}

/// Cache backed by a Redis-protocol server.
///
/// A background task owns (re)connection. Operations never wait for a
/// connection: while not connected they return immediately as a miss or a
/// no-op. Any failed or timed out operation drops the connection and hands
/// control back to the reconnect loop, which also notices a server closing
/// an idle connection.
pub struct RemoteCache {
    inner: Arc<Inner>,
    reconnect_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RemoteCache {
    /// Parse `url` and start connecting in the background.
    pub fn connect(url: &str, options: RemoteCacheOptions) -> Result<Self> {
        let address = RedisAddress::parse(url)?;
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            address,
            options,
            connection: Mutex::new(None),
            state,
            shutdown,
        });
        let task = tokio::spawn(reconnect_loop(inner.clone()));

        Ok(Self {
            inner,
            reconnect_task: std::sync::Mutex::new(Some(task)),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Wait until the cache reaches `target`, or `limit` passes.
    pub async fn wait_for_state(&self, target: ConnectionState, limit: Duration) -> bool {
        let mut rx = self.inner.state.subscribe();
        tokio::time::timeout(limit, rx.wait_for(|state| *state == target))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.inner.options.key_prefix, key)
    }

    /// Run `op` on the live connection under the operation timeout. `None`
    /// when not connected; any failure disconnects.
    async fn with_connection<T, F>(&self, what: &str, op: F) -> Option<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut RespConnection) -> BoxFuture<'c, Result<T>> + Send,
    {
        if self.state() != ConnectionState::Connected {
            return None;
        }

        let timeout = self.inner.options.operation_timeout;
        let outcome = tokio::time::timeout(timeout, async {
            let mut guard = self.inner.connection.lock().await;
            let Some(connection) = guard.as_mut() else {
                return Err(anyhow!("no connection"));
            };
            op(connection).await
        })
        .await;

        match outcome {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!("Cache {} failed: {}", what, e);
                self.inner.drop_connection().await;
                None
            }
            Err(_) => {
                warn!("Cache {} timed out after {:?}", what, timeout);
                self.inner.drop_connection().await;
                None
            }
        }
    }
}

impl Inner {
    async fn drop_connection(&self) {
        self.connection.lock().await.take();
        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Skipped while an operation holds the connection; that operation will
    /// see the failure itself.
    fn peer_closed(&self) -> bool {
        match self.connection.try_lock() {
            Ok(mut guard) => guard.as_mut().is_some_and(|c| c.peer_closed()),
            Err(_) => false,
        }
    }

    async fn open(&self) -> Result<RespConnection> {
        let stream = TcpStream::connect(self.address.socket_addr()).await?;
        stream.set_nodelay(true)?;
        let mut connection = RespConnection::new(stream);

        if let Some(password) = &self.address.password {
            let reply = connection.command(&[b"AUTH".as_slice(), password.as_bytes()]).await?;
            if !reply.is_ok() {
                return Err(anyhow!("AUTH rejected: {reply:?}"));
            }
        }
        if let Some(db) = self.address.db {
            let db = db.to_string();
            let reply = connection.command(&[b"SELECT".as_slice(), db.as_bytes()]).await?;
            if !reply.is_ok() {
                return Err(anyhow!("SELECT rejected: {reply:?}"));
            }
        }
        Ok(connection)
    }
}

/// DISCONNECTED -> CONNECTING -> CONNECTED -> (error) DISCONNECTED, with a
/// jittered backoff between attempts, until shutdown.
async fn reconnect_loop(inner: Arc<Inner>) {
    let mut backoff = Backoff::new(
        inner.options.reconnect_base,
        inner.options.reconnect_cap,
    );
    let mut shutdown = inner.shutdown.subscribe();
    let mut state_rx = inner.state.subscribe();

    'connect: loop {
        if *shutdown.borrow() {
            break;
        }

        inner.state.send_replace(ConnectionState::Connecting);
        debug!("Connecting to cache at {}", inner.address.socket_addr());
        match tokio::time::timeout(inner.options.operation_timeout, inner.open()).await {
            Ok(Ok(connection)) => {
                *inner.connection.lock().await = Some(connection);
                inner.state.send_replace(ConnectionState::Connected);
                info!("Connected to cache at {}", inner.address.socket_addr());
                backoff.reset();

                // Stay here until the connection is dropped.
                let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);
                liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = async { let _ = state_rx.wait_for(|s| *s == ConnectionState::Disconnected).await; } => {
                            info!("Cache connection lost");
                            break;
                        }
                        _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break 'connect,
                        _ = liveness.tick() => {
                            if inner.peer_closed() {
                                info!("Cache server closed the idle connection");
                                inner.drop_connection().await;
                            }
                        }
                    }
                }
            }
            Ok(Err(e)) => {
                inner.state.send_replace(ConnectionState::Disconnected);
                debug!("Cache connection attempt failed: {}", e);
            }
            Err(_) => {
                inner.state.send_replace(ConnectionState::Disconnected);
                debug!("Cache connection attempt timed out");
            }
        }

        let delay = backoff.next_delay();
        debug!("Reconnecting to cache in {:?}", delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.wait_for(|stop| *stop) => break 'connect,
        }
    }

    inner.connection.lock().await.take();
    inner.state.send_replace(ConnectionState::Disconnected);
    debug!("Cache reconnect loop stopped");
}

fn expiration_secs(expiration: Duration) -> String {
    expiration.as_secs().max(1).to_string()
}

#[async_trait]
impl ResultCache for RemoteCache {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn get(&self, key: &str) -> Option<String> {
        let key = self.prefixed(key);
        let reply = self
            .with_connection("get", |c| {
                Box::pin(async move { c.command(&[b"GET".as_slice(), key.as_bytes()]).await })
            })
            .await?;
        match reply {
            RespValue::Bulk(Some(bytes)) => String::from_utf8(bytes).ok(),
            RespValue::Bulk(None) => None,
            other => {
                warn!("Unexpected GET reply: {:?}", other);
                None
            }
        }
    }

    async fn set(&self, key: &str, value: &str, expiration: Option<Duration>) {
        let key = self.prefixed(key);
        let value = value.to_string();
        let ok = self
            .with_connection("set", move |c| {
                Box::pin(async move {
                    match expiration {
                        None => {
                            let reply = c.command(&[b"SET".as_slice(), key.as_bytes(), value.as_bytes()]).await?;
                            Ok(reply.is_ok())
                        }
                        Some(expiration) => {
                            // Atomic so a failure cannot leave an entry without TTL.
                            let secs = expiration_secs(expiration);
                            let replies = c
                                .pipeline(&[
                                    vec![b"MULTI".as_slice()],
                                    vec![b"SET".as_slice(), key.as_bytes(), value.as_bytes()],
                                    vec![b"EXPIRE".as_slice(), key.as_bytes(), secs.as_bytes()],
                                    vec![b"EXEC".as_slice()],
                                ])
                                .await?;
                            Ok(matches!(
                                replies.last(),
                                Some(RespValue::Array(Some(results)))
                                    if results.first().is_some_and(RespValue::is_ok)
                            ))
                        }
                    }
                })
            })
            .await;

        if ok == Some(false) {
            warn!("Cache rejected SET");
        }
    }

    async fn remove(&self, key: &str) {
        let key = self.prefixed(key);
        self.with_connection("remove", |c| {
            Box::pin(async move { c.command(&[b"DEL".as_slice(), key.as_bytes()]).await })
        })
        .await;
    }

    async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let task = self
            .reconnect_task
            .lock()
            .ok()
            .and_then(|mut task| task.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                debug!("Cache reconnect task ended abnormally: {}", e);
            }
        }
        self.inner.drop_connection().await;
        info!("Remote cache shut down");
    }
}

impl Drop for RemoteCache {
    fn drop(&mut self) {
        self.inner.shutdown.send_replace(true);
    }
}

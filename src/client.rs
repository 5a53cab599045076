//! Client-side correlator.
//!
//! The [`ProxyClient`] is the harness's stand-in for the remote target:
//! every call is an envelope sent down the call pipe, and a background
//! receive task matches reply envelopes back to waiting callers using
//! correlation ids.
//!
//! # Concurrency
//!
//! Any number of calls may be in flight at once. Each call registers a
//! oneshot channel in the pending map keyed by its id; the receive loop
//! removes the entry and completes the channel when the matching reply
//! arrives, so no caller ever sees another call's reply and nothing is
//! retained after delivery. Replies may arrive in any order.
//!
//! # Shutdown
//!
//! When the reply stream ends (or turns malformed), the receive loop
//! retires the pending map; dropping the senders fails every still
//! waiting caller with `ConnectionClosed` instead of leaving it parked
//! forever, and calls issued afterwards fail the same way up front.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time;

use crate::config::ClientConfig;
use crate::error::{ProxyError, Result};
use crate::protocol::{CallId, Envelope};
use crate::transport::EnvelopeReader;
use crate::writer::{spawn_writer_task, WriterHandle};

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// The protected state is a best-effort pending map (call id -> oneshot
/// sender) with no invariants spanning multiple fields; the worst
/// outcome of ignoring poison is a dropped reply, and stream-level
/// failures are handled by the receive loop. This also avoids carrying
/// non-`Send` poison errors across await points.
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

type PendingMap = HashMap<CallId, oneshot::Sender<Envelope>>;

/// Running proxy client.
///
/// Cheap to clone (internally `Arc`-backed); clones share the pending
/// map and the connection.
#[derive(Clone)]
pub struct ProxyClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ProxyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyClient").finish_non_exhaustive()
    }
}

struct Inner {
    writer: WriterHandle,
    /// `None` once the receive loop has exited; registering a call
    /// against a dead connection fails instead of parking forever.
    pending: Mutex<Option<PendingMap>>,
    config: ClientConfig,

    /// Keeps the writer task from being detached invisibly.
    _writer_task: JoinHandle<Result<()>>,
    /// Receive loop handle; exits when the stream ends or every client
    /// clone is dropped.
    _rx_task: JoinHandle<()>,
}

impl ProxyClient {
    /// Connect over an established pipe pair.
    ///
    /// Reads the server's one-time handshake before returning, so a
    /// connected client is always ready to issue calls. A well-behaved
    /// server sends the handshake before anything else; any other first
    /// envelope is a protocol error.
    ///
    /// # Errors
    ///
    /// - `ProxyError::ConnectionClosed` if the stream ends before the
    ///   handshake
    /// - `ProxyError::Protocol` if the first envelope is not the
    ///   handshake
    pub async fn connect<R, W>(reader: R, writer: W, config: ClientConfig) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer_handle, writer_task) = spawn_writer_task(writer, config.writer.clone());

        let mut reader = EnvelopeReader::new(reader);
        match reader.next().await? {
            None => return Err(ProxyError::ConnectionClosed),
            Some(envelope) if envelope.is_handshake() => {
                tracing::debug!("handshake received, server ready");
            }
            Some(envelope) => {
                return Err(ProxyError::Protocol(format!(
                    "first envelope was not the handshake: {envelope:?}"
                )));
            }
        }

        // The receive loop holds only a weak reference so dropping the
        // last client clone lets everything unwind.
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();

            let rx_task = tokio::spawn(async move {
                loop {
                    match reader.next().await {
                        Ok(Some(envelope)) => {
                            let Some(inner) = weak.upgrade() else { break };
                            Self::deliver(&inner, envelope);
                        }
                        Ok(None) => {
                            tracing::debug!("reply stream closed");
                            break;
                        }
                        Err(e) => {
                            tracing::warn!("reply stream failed: {e}");
                            break;
                        }
                    }
                }

                // Retire the map: dropping the senders fails every
                // still-outstanding caller, and the `None` left behind
                // marks the connection dead for later calls.
                if let Some(inner) = weak.upgrade() {
                    lock_ignore_poison(&inner.pending).take();
                }
            });

            Inner {
                writer: writer_handle,
                pending: Mutex::new(Some(PendingMap::new())),
                config,
                _writer_task: writer_task,
                _rx_task: rx_task,
            }
        });

        Ok(Self { inner })
    }

    /// Route one inbound envelope to its waiting caller.
    fn deliver(inner: &Arc<Inner>, envelope: Envelope) {
        if envelope.method_name.is_some() {
            tracing::warn!("dropping inbound call envelope (wrong direction)");
            return;
        }
        let Some(id) = envelope.id.clone() else {
            tracing::warn!("dropping duplicate handshake envelope");
            return;
        };

        let tx = lock_ignore_poison(&inner.pending)
            .as_mut()
            .and_then(|map| map.remove(&id));
        match tx {
            Some(tx) => {
                if tx.send(envelope).is_err() {
                    tracing::debug!(%id, "reply arrived after call abandoned");
                }
            }
            None => {
                // Unknown correlation id: protocol violation, but not
                // worth killing unrelated in-flight calls over.
                tracing::warn!(%id, "reply with unknown correlation id");
            }
        }
    }

    /// Invoke a remote method and wait for its reply.
    ///
    /// Generates a fresh correlation id, sends the call envelope, and
    /// suspends until the receive loop delivers the matching reply.
    /// With a configured `call_timeout`, the pending entry is removed
    /// on expiry so a late reply cannot resurrect the call.
    ///
    /// # Errors
    ///
    /// - `ProxyError::Remote` if the target raised; carries the
    ///   original kind and message
    /// - `ProxyError::Protocol` if the reply has neither result nor
    ///   exception
    /// - `ProxyError::ConnectionClosed` if the connection is already
    ///   dead or dies while waiting
    /// - `ProxyError::Timeout` if the reply deadline passed
    pub async fn invoke(
        &self,
        method_name: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<Value> {
        let id = CallId::generate();
        let (tx, rx) = oneshot::channel();
        match lock_ignore_poison(&self.inner.pending).as_mut() {
            Some(map) => {
                map.insert(id.clone(), tx);
            }
            // Receive loop already exited; nothing would ever wake us.
            None => return Err(ProxyError::ConnectionClosed),
        }

        let envelope = Envelope::call(id.clone(), method_name, args, kwargs);
        tracing::debug!(%id, method = method_name, "sending call");

        if let Err(e) = self.inner.writer.send(&envelope).await {
            Self::abandon(&self.inner, &id);
            return Err(e);
        }

        let received = match self.inner.config.call_timeout {
            Some(timeout) => match time::timeout(timeout, rx).await {
                Ok(received) => received,
                Err(_) => {
                    Self::abandon(&self.inner, &id);
                    tracing::debug!(%id, method = method_name, "call timed out");
                    return Err(ProxyError::Timeout);
                }
            },
            None => rx.await,
        };

        let reply = received.map_err(|_| ProxyError::ConnectionClosed)?;
        reply.into_outcome()
    }

    /// Invoke with positional arguments only and deserialize the result.
    pub async fn call<R: DeserializeOwned>(&self, method_name: &str, args: Vec<Value>) -> Result<R> {
        let value = self.invoke(method_name, args, BTreeMap::new()).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Drop the pending entry for an abandoned call.
    fn abandon(inner: &Inner, id: &CallId) {
        if let Some(map) = lock_ignore_poison(&inner.pending).as_mut() {
            map.remove(id);
        }
    }

    /// Number of calls currently awaiting replies.
    pub fn pending_calls(&self) -> usize {
        lock_ignore_poison(&self.inner.pending)
            .as_ref()
            .map_or(0, |map| map.len())
    }
}

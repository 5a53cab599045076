//! Server-side dispatch loop.
//!
//! The [`ProxyServer`] owns the child's end of the pipes. Lifecycle:
//! 1. Spawn the writer task for the reply pipe
//! 2. Send the one-time handshake envelope (`Handshaking` -> `Ready`)
//! 3. Read call envelopes and spawn one invocation task per call,
//!    bounded by a semaphore
//! 4. On end-of-stream, stop accepting (`Draining`), wait for in-flight
//!    calls and the target's own `wait()`, then close
//!
//! # Example
//!
//! ```ignore
//! use pipeproxy::{transport, ProxyServer};
//!
//! #[tokio::main]
//! async fn main() -> pipeproxy::Result<()> {
//!     let (reader, writer) = transport::child_endpoints()?;
//!     ProxyServer::builder(HttpEchoServer::new(cookie))
//!         .method("bind", |srv, args| async move { srv.bind(args.arg(0)?) })
//!         .method("restart", |srv, _| async move { srv.restart() })
//!         .build()
//!         .run(reader, writer)
//!         .await
//! }
//! ```

mod invoker;

pub use invoker::{
    BoxFuture, CallArgs, Invoker, Method, MethodRegistry, MethodResult, Mode, PassthroughMode,
    TypedMethod,
};

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Semaphore;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::protocol::{Envelope, RemoteError};
use crate::transport::EnvelopeReader;
use crate::writer::{spawn_writer_task, WriterHandle};

/// The proxied server under test, as seen by the dispatch loop.
///
/// `wait()` is called once during draining so server-side work that
/// outlives the call stream (accepted client connections, background
/// threads) can finish before the process terminates.
pub trait Target: Send + Sync + 'static {
    /// Wait for in-progress server-side work to finish.
    fn wait(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// Builder for configuring a [`ProxyServer`].
pub struct ProxyServerBuilder<T> {
    target: Arc<T>,
    registry: MethodRegistry<T>,
    mode: Arc<dyn Mode<T>>,
    config: ServerConfig,
}

impl<T: Target> ProxyServerBuilder<T> {
    fn new(target: Arc<T>) -> Self {
        Self {
            target,
            registry: MethodRegistry::new(),
            mode: Arc::new(PassthroughMode),
            config: ServerConfig::default(),
        }
    }

    /// Register a method handler.
    pub fn method<F, Fut, R>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Arc<T>, CallArgs) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<R, crate::protocol::RemoteError>>
            + Send
            + 'static,
        R: serde::Serialize + Send + 'static,
    {
        self.registry.register(name, handler);
        self
    }

    /// Install the mode supplying pre/post hooks.
    pub fn mode(mut self, mode: impl Mode<T>) -> Self {
        self.mode = Arc::new(mode);
        self
    }

    /// Override the server configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the server.
    pub fn build(self) -> ProxyServer<T> {
        ProxyServer {
            invoker: Invoker::new(self.target, self.registry, self.mode),
            config: self.config,
        }
    }
}

/// Dispatch state, surfaced in logs.
#[derive(Debug, Clone, Copy)]
enum State {
    Handshaking,
    Ready,
    Draining,
    Closed,
}

/// Server-side dispatcher consuming call envelopes and writing replies.
pub struct ProxyServer<T> {
    invoker: Invoker<T>,
    config: ServerConfig,
}

impl<T: Target> ProxyServer<T> {
    /// Start building a server around a target.
    pub fn builder(target: T) -> ProxyServerBuilder<T> {
        ProxyServerBuilder::new(Arc::new(target))
    }

    /// Start building a server around an already-shared target.
    ///
    /// Useful when the caller keeps its own handle, e.g. to observe
    /// the target after the dispatch loop finishes.
    pub fn builder_shared(target: Arc<T>) -> ProxyServerBuilder<T> {
        ProxyServerBuilder::new(target)
    }

    /// Run the dispatch loop until the call stream ends.
    ///
    /// Completes after draining: all in-flight invocations have
    /// replied, the target's `wait()` has returned, and the reply pipe
    /// has been flushed and released.
    ///
    /// # Errors
    ///
    /// Returns transport or protocol errors from the call stream; the
    /// drain still runs first so accepted work is not abandoned.
    pub async fn run<R, W>(self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut state = State::Handshaking;
        tracing::debug!(?state, "proxy server starting");

        let (writer_handle, writer_task) = spawn_writer_task(writer, self.config.writer.clone());

        // The handshake must precede every reply.
        writer_handle.send(&Envelope::handshake()).await?;
        state = State::Ready;
        tracing::debug!(?state, "handshake sent, accepting calls");

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_calls));
        let mut reader = EnvelopeReader::new(reader);

        let loop_result = loop {
            match reader.next().await {
                Ok(Some(envelope)) => {
                    self.dispatch(envelope, &writer_handle, &semaphore).await;
                }
                Ok(None) => break Ok(()),
                Err(e) => {
                    tracing::error!("call stream failed: {e}");
                    break Err(e);
                }
            }
        };

        state = State::Draining;
        tracing::debug!(?state, "call stream ended, waiting for in-flight calls");

        // Reclaiming every permit means no invocation task is still
        // running (each holds one until its reply is queued).
        let max = self.config.max_concurrent_calls as u32;
        if let Ok(_permits) = semaphore.acquire_many(max).await {
            tracing::debug!("all invocation tasks finished");
        }

        // Let server-side work the calls started (e.g. accepted client
        // connections) finish before terminating.
        self.invoker.target().wait().await;

        // Release the reply pipe; the writer task drains and exits.
        drop(writer_handle);
        if let Ok(writer_result) = writer_task.await {
            writer_result?;
        }

        state = State::Closed;
        tracing::debug!(?state, "proxy server stopped");
        loop_result
    }

    /// Admit one inbound envelope and spawn its invocation task.
    ///
    /// Queue-full policy: waits for a semaphore permit, so admission
    /// stays in pipe order and backpressure reaches the pipe itself.
    async fn dispatch(
        &self,
        envelope: Envelope,
        writer: &WriterHandle,
        semaphore: &Arc<Semaphore>,
    ) {
        let (id, method_name) = match (envelope.id, envelope.method_name) {
            (Some(id), Some(method)) => (id, method),
            (Some(id), None) => {
                if envelope.result.is_some() || envelope.exception.is_some() {
                    // Reply envelopes belong on the other pipe.
                    tracing::warn!(%id, "dropping inbound reply envelope (wrong direction)");
                } else {
                    tracing::warn!(%id, "call envelope without method name");
                    let fault = Envelope::fault(
                        id,
                        RemoteError::bad_envelope("call envelope carries no method name"),
                    );
                    if let Err(e) = writer.send(&fault).await {
                        tracing::error!("failed to queue fault reply: {e}");
                    }
                }
                return;
            }
            (None, method) => {
                tracing::warn!(?method, "dropping envelope without correlation id");
                return;
            }
        };

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return, // Semaphore closed, shutting down.
        };

        let invoker = self.invoker.clone();
        let writer = writer.clone();
        let args = CallArgs::new(envelope.args, envelope.kwargs);

        tokio::spawn(async move {
            // Held until the reply is queued; draining counts on this.
            let _permit = permit;

            tracing::debug!(%id, method = %method_name, "invoking");
            let reply = match invoker.invoke(&method_name, args).await {
                Ok(value) => Envelope::reply(id.clone(), value),
                Err(remote) => {
                    tracing::debug!(%id, method = %method_name, error = %remote, "call failed");
                    Envelope::fault(id.clone(), remote)
                }
            };

            if let Err(e) = writer.send(&reply).await {
                tracing::error!(%id, "failed to queue reply: {e}");
            }
        });
    }
}

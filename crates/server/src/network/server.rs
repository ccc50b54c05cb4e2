//! HTTP listener
//!
//! Accepts connections, spawns one task per connection and tracks them in a
//! `JoinSet`. The accept loop waits at most [`ACCEPT_POLL_INTERVAL`] per
//! attempt so it notices shutdown promptly. On shutdown every subscriber is
//! closed, the listener is dropped and connection tasks get a bounded grace
//! period before the rest are aborted.

use anyhow::{Context, Result};
use common::Shutdown;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::http::{DEFAULT_REQUEST_TIMEOUT, HttpError, read_request, write_response};
use super::router::{Route, Router, error_response};
use super::stream::{EventStream, StreamOptions};

/// Longest a single accept wait lasts before the shutdown flag is checked
pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Grace period for open connections at shutdown
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection-level timeouts
#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    pub request_timeout: Duration,
    pub stream: StreamOptions,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            stream: StreamOptions::default(),
        }
    }
}

pub struct HttpServer {
    listener: TcpListener,
    router: Arc<Router>,
    shutdown: Shutdown,
    options: ServerOptions,
}

impl HttpServer {
    /// Bind the listening socket
    pub async fn bind(
        addr: SocketAddr,
        router: Arc<Router>,
        shutdown: Shutdown,
        options: ServerOptions,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to listen on {}", addr))?;
        Ok(Self {
            listener,
            router,
            shutdown,
            options,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    /// Serve until shutdown is triggered
    pub async fn run(self) -> Result<()> {
        let HttpServer {
            listener,
            router,
            shutdown,
            options,
        } = self;

        info!("HTTP server listening on {}", listener.local_addr()?);
        let mut connections = JoinSet::new();

        while !shutdown.is_triggered() {
            match timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await {
                Err(_) => {}
                Ok(Ok((stream, peer))) => {
                    debug!("Accepted connection from {}", peer);
                    let router = Arc::clone(&router);
                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        handle_connection(stream, peer, &router, &shutdown, options).await;
                    });
                }
                Ok(Err(e)) => {
                    // Typically EMFILE or a reset before accept; keep serving
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }

            while let Some(joined) = connections.try_join_next() {
                if let Err(e) = joined {
                    error!("Connection task failed: {}", e);
                }
            }
        }

        info!("Shutting down HTTP server");
        drop(listener);
        router.hub().close().await;

        let open = connections.len();
        if open > 0 {
            debug!("Waiting for {} connection(s) to finish", open);
            let drained = timeout(DRAIN_TIMEOUT, async {
                while connections.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(
                    "Aborting {} connection(s) still open after {:?}",
                    connections.len(),
                    DRAIN_TIMEOUT
                );
                connections.shutdown().await;
            }
        }

        info!("HTTP server stopped");
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: &Router,
    shutdown: &Shutdown,
    options: ServerOptions,
) {
    let (mut reader, mut writer) = stream.into_split();
    let write_timeout = options.stream.write_timeout;

    let request = match read_request(&mut reader, options.request_timeout).await {
        Ok(request) => request,
        Err(e) => {
            log_request_error(peer, &e);
            if let Some(status) = e.status() {
                let _ = write_response(&mut writer, &error_response(status), write_timeout).await;
            }
            return;
        }
    };
    debug!("{} {} {}", peer, request.method, request.path);

    let response = match Route::resolve(request.method, &request.path) {
        Ok(Route::Events) => {
            EventStream::new(
                reader,
                writer,
                peer,
                router.registry(),
                router.hub(),
                shutdown,
                options.stream,
            )
            .run()
            .await;
            return;
        }
        Ok(route) => router.respond(route, &request).await,
        Err(status) => error_response(status),
    };

    if let Err(e) = write_response(&mut writer, &response, write_timeout).await {
        debug!("Failed to answer {}: {}", peer, e);
    }
}

fn log_request_error(peer: SocketAddr, e: &HttpError) {
    match e {
        HttpError::ConnectionClosed | HttpError::Io(_) => {
            debug!("{} went away before sending a request: {}", peer, e)
        }
        _ => warn!("Bad request from {}: {}", peer, e),
    }
}

//! TCP transport layer.
//!
//! One accept loop per enabled protocol. Each accepted connection is
//! registered with the drain controller and served in its own task.

use std::future::{Future, IntoFuture};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::Router;
use serde_json::Value;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    ReadBuf,
};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use super::binary::{FrameRequest, FrameResponse, MAX_FRAME_LEN, read_frame, write_frame};
use super::drain::{ConnectionGuard, DrainTokens, EventSender, Protocol};
use super::protocol::{Request, Response, request_id};
use super::registry::ServiceRegistry;
use crate::error::{ServerError, TransportError};

/// Shared state handed to every RPC connection task.
pub(crate) struct ConnectionContext {
    pub registry: Arc<ServiceRegistry>,
    pub events: EventSender,
    pub tokens: DrainTokens,
    pub idle_timeout: Option<Duration>,
}

/// Accept RPC connections until the listener token is cancelled.
pub(crate) async fn accept_loop(
    listener: TcpListener,
    protocol: Protocol,
    ctx: Arc<ConnectionContext>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(%protocol, %addr, "Listening");
    }

    loop {
        let accepted = tokio::select! {
            biased;
            _ = ctx.tokens.listeners.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!(%protocol, %peer, "Client connected");
                let guard = ctx.events.open(protocol, Some(peer));
                tokio::spawn(serve_connection(stream, peer, protocol, guard, Arc::clone(&ctx)));
            }
            Err(e) if ctx.tokens.listeners.is_cancelled() => {
                debug!(%protocol, error = %e, "Accept failed during shutdown");
                break;
            }
            Err(e) => {
                error!(%protocol, error = %e, "Failed to accept connection");
                ctx.events.fatal(ServerError::FatalListen {
                    protocol,
                    source: e,
                });
                ctx.tokens.listeners.cancelled().await;
                break;
            }
        }
    }

    drop(listener);
    ctx.events.acceptor_stopped(protocol);
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    protocol: Protocol,
    _guard: ConnectionGuard,
    ctx: Arc<ConnectionContext>,
) {
    let served = async {
        match protocol {
            Protocol::Binary => serve_binary(stream, &ctx).await,
            _ => serve_json(stream, peer, &ctx).await,
        }
    };

    tokio::select! {
        result = served => {
            if let Err(e) = result {
                debug!(%protocol, %peer, error = %e, "Connection error");
            }
        }
        _ = ctx.tokens.connections.cancelled() => {
            warn!(%protocol, %peer, "Connection force-closed");
        }
    }
    debug!(%protocol, %peer, "Client disconnected");
}

/// Await `read`, failing if the connection stays idle past the deadline.
async fn idle_bounded<T, E, F>(idle: Option<Duration>, read: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<TransportError>,
{
    match idle {
        Some(limit) => tokio::time::timeout(limit, read)
            .await
            .map_err(|_| TransportError::IdleTimeout(limit))?
            .map_err(Into::into),
        None => read.await.map_err(Into::into),
    }
}

/// Read one line of at most `limit` bytes plus its newline.
///
/// Returns the bytes read, zero at EOF.
async fn read_bounded_line<R>(
    reader: &mut R,
    line: &mut String,
    limit: usize,
) -> Result<usize, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    let read = reader.take(limit as u64 + 1).read_line(line).await?;
    if read > limit && !line.ends_with('\n') {
        return Err(TransportError::FrameTooLarge(read));
    }
    Ok(read)
}

/// Newline-delimited JSON-RPC.
async fn serve_json(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: &ConnectionContext,
) -> Result<(), TransportError> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let read = read_bounded_line(&mut reader, &mut line, MAX_FRAME_LEN);
        let bytes_read = idle_bounded(ctx.idle_timeout, read).await?;

        if bytes_read == 0 {
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(trimmed) {
            Ok(request) => {
                let id = request.id;
                match ctx.registry.dispatch(&request.method, request.params).await {
                    Ok(result) => Response::success(id, result),
                    Err(e) => {
                        debug!(%peer, method = %request.method, error = %e, "Call failed");
                        Response::failure(id, e.into_wire())
                    }
                }
            }
            Err(e) => {
                warn!(%peer, error = %e, "Parse error");
                Response::parse_error(request_id(trimmed), e)
            }
        };

        let mut response_json = serde_json::to_string(&response)?;
        response_json.push('\n');
        writer.write_all(response_json.as_bytes()).await?;
    }

    Ok(())
}

/// Length-prefixed binary frames.
async fn serve_binary(stream: TcpStream, ctx: &ConnectionContext) -> Result<(), TransportError> {
    let (mut reader, mut writer) = stream.into_split();

    loop {
        let request: Option<FrameRequest> =
            idle_bounded(ctx.idle_timeout, read_frame(&mut reader)).await?;
        let Some(request) = request else {
            break;
        };

        let params = if request.params.is_empty() {
            Ok(Value::Null)
        } else {
            serde_json::from_slice::<Value>(&request.params)
        };

        let response = match params {
            Ok(params) => match ctx.registry.dispatch(&request.method, params).await {
                Ok(result) => FrameResponse {
                    seq: request.seq,
                    error: None,
                    result: serde_json::to_vec(&result)?,
                },
                Err(e) => FrameResponse {
                    seq: request.seq,
                    error: Some(e.into_text()),
                    result: Vec::new(),
                },
            },
            Err(e) => FrameResponse {
                seq: request.seq,
                error: Some(format!("rpc: invalid params encoding: {}", e)),
                result: Vec::new(),
            },
        };

        write_frame(&mut writer, &response).await?;
    }

    Ok(())
}

/// Serve an axum router, accounting each HTTP connection with the controller.
pub(crate) async fn serve_http(
    listener: TcpListener,
    router: Router,
    events: EventSender,
    tokens: DrainTokens,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(protocol = %Protocol::Http, %addr, "Listening");
    }

    let tracked = TrackedListener {
        inner: listener,
        events: events.clone(),
        tokens: tokens.clone(),
    };
    let listeners = tokens.listeners.clone();
    let serve = axum::serve(tracked, router)
        .with_graceful_shutdown(async move { listeners.cancelled().await })
        .into_future();

    tokio::select! {
        result = serve => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = tokens.connections.cancelled() => {
            warn!("HTTP server force-closed");
        }
    }

    events.acceptor_stopped(Protocol::Http);
}

/// Listener whose streams carry a [`ConnectionGuard`].
struct TrackedListener {
    inner: TcpListener,
    events: EventSender,
    tokens: DrainTokens,
}

impl axum::serve::Listener for TrackedListener {
    type Io = TrackedStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.inner.accept().await {
            Ok((stream, peer)) => {
                debug!(protocol = %Protocol::Http, %peer, "Client connected");
                let guard = self.events.open(Protocol::Http, Some(peer));
                (
                    TrackedStream {
                        stream,
                        _guard: guard,
                    },
                    peer,
                )
            }
            Err(e) => {
                if !self.tokens.listeners.is_cancelled() {
                    error!(protocol = %Protocol::Http, error = %e, "Failed to accept connection");
                    self.events.fatal(ServerError::FatalListen {
                        protocol: Protocol::Http,
                        source: e,
                    });
                }
                // The graceful shutdown signal ends the serve loop from here.
                std::future::pending().await
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

pub(crate) struct TrackedStream {
    stream: TcpStream,
    _guard: ConnectionGuard,
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }
}

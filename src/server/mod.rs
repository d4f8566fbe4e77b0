//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and dispatches HTTP/1.1 requests to a handler function
//! or a whole [`App`]. Supports HTTP/1.1 persistent connections (keep-alive) out
//! of the box.
//!
//! ```text
//! accept → spawn per connection
//!     loop: read → Request::parse → wait for Content-Length body
//!           → handler → Exchange
//!                ├─ Reply(Response)   → write (body omitted for HEAD), keep-alive?
//!                └─ Events(receiver)  → SSE head, one frame per HmrEvent, until closed
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::BoxFuture;
use crate::app::App;
use crate::app::dev::{HmrEvent, SSE_CONNECTED};
use crate::http::{
    Method, StatusCode,
    request::{Request, RequestError},
    response::Response,
};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

const SSE_HEAD: &str = "HTTP/1.1 200 OK\r\n\
    Content-Type: text/event-stream\r\n\
    Cache-Control: no-cache\r\n\
    Connection: keep-alive\r\n\r\n";

/// What a connection writes back for one request.
pub enum Exchange {
    /// A complete response.
    Reply(Response),
    /// A server-sent-events stream that holds the connection until the sender closes.
    Events(broadcast::Receiver<HmrEvent>),
}

type Service = Arc<dyn Fn(Request) -> BoxFuture<'static, Exchange> + Send + Sync>;

/// The islet HTTP server.
///
/// Binds to a TCP address and dispatches incoming HTTP/1.1 requests to a
/// handler function or an [`App`].
///
/// # Examples
///
/// ```rust,no_run
/// use islet::server::Server;
/// use islet::http::{Request, Response, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(|_req| async {
///         Response::new(StatusCode::Ok).body("Hello!")
///     }).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts accepting connections and dispatching requests to `handler`.
    ///
    /// The handler receives a [`Request`] and must return a [`Future`] that
    /// resolves to a [`Response`]. It is shared across all spawned Tokio tasks,
    /// so it must be `Send + Sync + 'static`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run<H, F>(self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        let service: Service = Arc::new(move |request: Request| -> BoxFuture<'static, Exchange> {
            let fut = handler(request);
            Box::pin(async move { Exchange::Reply(fut.await) })
        });
        self.accept_loop(service).await
    }

    /// Serves `app`: pages, API routes, runtime endpoints and, in dev mode,
    /// the HMR event stream.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn serve(self, app: App) -> Result<(), ServerError> {
        let service: Service = Arc::new(move |request: Request| -> BoxFuture<'static, Exchange> {
            let app = app.clone();
            Box::pin(async move {
                if app.is_hmr_request(&request) {
                    Exchange::Events(app.subscribe_hmr())
                } else {
                    Exchange::Reply(app.handle(request).await)
                }
            })
        });
        self.accept_loop(service).await
    }

    async fn accept_loop(self, service: Service) -> Result<(), ServerError> {
        info!(address = %self.local_addr, "islet listening");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let service = Arc::clone(&service);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, service).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Handles a single TCP connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, reading one
/// request per iteration, until the peer closes the connection, signals
/// `Connection: close`, or the connection is handed to an event stream.
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    service: Service,
) -> Result<(), std::io::Error> {
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        let bytes_read = stream.read_buf(&mut buf).await?;

        if bytes_read == 0 {
            debug!(peer = %peer_addr, "connection closed by peer");
            break;
        }

        if buf.len() > MAX_REQUEST_SIZE {
            warn!(peer = %peer_addr, "request too large, sending 413");
            let response = Response::new(StatusCode::PayloadTooLarge)
                .body("Request entity too large")
                .keep_alive(false);
            stream.write_all(&response.into_bytes()).await?;
            break;
        }

        let (request, body_offset) = match Request::parse(&buf) {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => continue,
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                let response = Response::new(StatusCode::BadRequest)
                    .body(format!("Bad Request: {e}"))
                    .keep_alive(false);
                stream.write_all(&response.into_bytes()).await?;
                break;
            }
        };

        // Wait for the full body to arrive if Content-Length is set.
        let content_length = request.content_length().unwrap_or(0);
        let total_needed = body_offset + content_length;
        if buf.len() < total_needed {
            continue;
        }

        let keep_alive = request.is_keep_alive();
        let head_only = *request.method() == Method::Head;

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        match service(request).await {
            Exchange::Reply(response) => {
                stream
                    .write_all(&response.keep_alive(keep_alive).to_wire(head_only))
                    .await?;
                stream.flush().await?;
            }
            Exchange::Events(events) => {
                stream_events(&mut stream, peer_addr, events).await?;
                break;
            }
        }

        // Drop the consumed request bytes from the buffer.
        let _ = buf.split_to(total_needed);

        if !keep_alive {
            debug!(peer = %peer_addr, "Connection: close, shutting down");
            break;
        }
    }

    Ok(())
}

async fn stream_events(
    stream: &mut TcpStream,
    peer_addr: SocketAddr,
    mut events: broadcast::Receiver<HmrEvent>,
) -> Result<(), std::io::Error> {
    stream.write_all(SSE_HEAD.as_bytes()).await?;
    stream.write_all(SSE_CONNECTED.as_bytes()).await?;
    stream.flush().await?;
    debug!(peer = %peer_addr, "hmr client connected");

    loop {
        match events.recv().await {
            Ok(event) => {
                stream.write_all(event.to_sse().as_bytes()).await?;
                stream.flush().await?;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(peer = %peer_addr, skipped, "hmr client lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppMode, FrameworkConfig};
    use crate::render::module::Page;
    use crate::render::view::Node;
    use tokio::io::AsyncBufReadExt;

    async fn spawn_app(mode: AppMode) -> (SocketAddr, App, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("site")).unwrap();
        std::fs::write(dir.path().join("site/(index).tsx"), "").unwrap();
        let app = App::builder(FrameworkConfig::default())
            .root(dir.path())
            .mode(mode)
            .page("(index).tsx", Page::new(|_| Ok(Node::text("served"))))
            .build()
            .unwrap();

        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.serve(app.clone()));
        (addr, app, dir)
    }

    async fn roundtrip(addr: SocketAddr, raw: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw.as_bytes()).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    #[tokio::test]
    async fn serves_pages_over_tcp() {
        let (addr, _app, _dir) = spawn_app(AppMode::Prod).await;
        let text = roundtrip(addr, "GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").await;
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.contains(r#"<div id="app">served</div>"#));
    }

    #[tokio::test]
    async fn head_keeps_length_but_drops_body() {
        let (addr, _app, _dir) = spawn_app(AppMode::Prod).await;
        let text = roundtrip(addr, "HEAD / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").await;
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(!text.contains("Content-Length: 0\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn malformed_request_gets_400() {
        let (addr, _app, _dir) = spawn_app(AppMode::Prod).await;
        let text = roundtrip(addr, "NOT A REQUEST\r\n\r\n").await;
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn hmr_stream_delivers_events() {
        let (addr, app, _dir) = spawn_app(AppMode::Dev).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /__hmr HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut reader = tokio::io::BufReader::new(stream);

        let mut line = String::new();
        loop {
            line.clear();
            reader.read_line(&mut line).await.unwrap();
            if line == "data: connected\n" {
                break;
            }
        }

        app.publish_hmr(HmrEvent::Reload);
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        if line == "\n" {
            line.clear();
            reader.read_line(&mut line).await.unwrap();
        }
        assert_eq!(line, "event: reload\n");
    }
}

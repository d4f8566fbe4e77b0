//! # islet
//!
//! File-based routing, SSR/SSG/ISR/PPR rendering and island hydration served
//! from an async HTTP/1.1 server.
//!
//! ```text
//! site/ ──scan──▶ RouteTable ──match──▶ middleware ──▶ Renderer ──▶ HTML + island markers
//!                                                        │
//!                                   page cache / PPR shells / hydration modules
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use islet::app::App;
//! use islet::config::{AppMode, FrameworkConfig};
//! use islet::render::module::Page;
//! use islet::render::view::Node;
//! use islet::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let app = App::builder(FrameworkConfig::default())
//!         .mode(AppMode::Dev)
//!         .page("(index).tsx", Page::new(|_| Ok(Node::element("h1").child(Node::text("Hello")))))
//!         .build()?;
//!
//!     let server = Server::bind("127.0.0.1:5173").await?;
//!     server.serve(app).await?;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod app;
pub mod cache;
pub mod config;
pub mod context;
pub mod http;
pub mod islands;
pub mod middleware;
pub mod render;
pub mod router;
pub mod server;

/// Boxed, `Send` future used at every async trait seam.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use app::{App, AppBuilder, AppError};
pub use config::{AppMode, FrameworkConfig, RenderMode};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use server::{Server, ServerError};

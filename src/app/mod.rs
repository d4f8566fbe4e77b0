//! The top-level request handler.
//!
//! [`App`] owns everything a request needs: the route table, the renderer and
//! its caches, the API registry, the injected store and the HMR channel.
//!
//! ```text
//! Request
//!     ├─ /__runtime/islands.js, /__runtime/hydrate.js   → bundled runtimes
//!     ├─ /__hydrate?file=…                              → transpiled module (cached)
//!     ├─ {api.prefix}…                                  → app middleware, ApiRegistry::dispatch
//!     ├─ GET/HEAD of a file under site/ or dist/        → static file
//!     └─ page route
//!          → RouteTable::match_path        (none → 404)
//!          → app middleware, then route middleware
//!                                          (short-circuit → its response)
//!          → Renderer::render              (error → 500)
//!          → HTML response                 (dev: HMR client injected)
//! ```

pub mod api;
pub mod assets;
pub mod dev;
pub mod export;

use std::error::Error as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::cache::hydration::{HydrationModuleCache, TranspileError, Transpiler, resolve_site_file};
use crate::config::{AppMode, ConfigError, FrameworkConfig, RenderMode};
use crate::context::{MemoryStore, MiddlewareContext, Params, Store};
use crate::http::{Request, Response, StatusCode};
use crate::islands::client::{HYDRATE_RUNTIME, ISLANDS_RUNTIME};
use crate::islands::{IslandDef, IslandRegistry};
use crate::middleware::{self, ChainOutcome, MiddlewareError, MiddlewareHandler};
use crate::render::module::{ModuleRegistry, RouteModule};
use crate::render::{RenderError, Renderer};
use crate::router::{RouteKind, RouteTable, ScanError, scan_routes};

use api::{ApiHandler, ApiRegistry};
use assets::StaticFiles;
use dev::{HmrEvent, inject_hmr};

/// Path of the islands bootstrap.
pub const ISLANDS_RUNTIME_PATH: &str = "/__runtime/islands.js";
/// Path of the page hydration entry runtime.
pub const HYDRATE_RUNTIME_PATH: &str = "/__runtime/hydrate.js";
/// Path serving transpiled route and island modules.
pub const HYDRATE_PATH: &str = "/__hydrate";
/// Dev-mode server-sent events endpoint.
pub const HMR_PATH: &str = "/__hmr";

const HMR_CAPACITY: usize = 64;

/// Errors surfaced by the application layer.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error("middleware failed: {0}")]
    Middleware(#[from] MiddlewareError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Transpile(#[from] TranspileError),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("file watcher failed: {0}")]
    Watch(#[from] notify::Error),
}

/// Builder for [`App`].
///
/// # Examples
///
/// ```no_run
/// use islet::app::App;
/// use islet::config::{AppMode, FrameworkConfig};
/// use islet::render::module::Page;
/// use islet::render::view::Node;
///
/// let app = App::builder(FrameworkConfig::default())
///     .root(".")
///     .mode(AppMode::Dev)
///     .page("(index).tsx", Page::new(|_| Ok(Node::text("home"))))
///     .build()
///     .unwrap();
/// # let _ = app;
/// ```
pub struct AppBuilder {
    config: FrameworkConfig,
    root: PathBuf,
    mode: AppMode,
    modules: ModuleRegistry,
    islands: IslandRegistry,
    api: ApiRegistry,
    middleware: Vec<MiddlewareHandler>,
    store: Option<Arc<dyn Store>>,
    transpiler: Option<Arc<dyn Transpiler>>,
}

impl AppBuilder {
    /// Project root the configured site and dist directories resolve against.
    #[must_use]
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    #[must_use]
    pub fn mode(mut self, mode: AppMode) -> Self {
        self.mode = mode;
        self
    }

    /// Registers the module backing the route file at `rel_path`.
    #[must_use]
    pub fn page(mut self, rel_path: impl Into<String>, module: impl RouteModule + 'static) -> Self {
        self.modules.register(rel_path, module);
        self
    }

    #[must_use]
    pub fn island(mut self, def: IslandDef) -> Self {
        self.islands.register(def);
        self
    }

    /// Registers an API handler; `name` is the path under the API prefix.
    #[must_use]
    pub fn api(mut self, name: impl Into<String>, handler: impl ApiHandler) -> Self {
        self.api.register(name, handler);
        self
    }

    /// Appends app-wide middleware. It runs for page and API requests, in
    /// registration order, before any route middleware.
    #[must_use]
    pub fn middleware(mut self, middleware: MiddlewareHandler) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Replaces the default in-memory store.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replaces the default pass-through transpiler used by `/__hydrate`.
    #[must_use]
    pub fn transpiler(mut self, transpiler: Arc<dyn Transpiler>) -> Self {
        self.transpiler = Some(transpiler);
        self
    }

    /// Validates the configuration and scans the site.
    ///
    /// # Errors
    ///
    /// [`AppError::Config`] for invalid configuration and [`AppError::Scan`]
    /// when the route table cannot be built.
    pub fn build(self) -> Result<App, AppError> {
        self.config.validate()?;
        let config = Arc::new(self.config);
        // Watcher events and hydration keys are absolute and canonical.
        let site_root = config.site_root(&self.root);
        let site_root = std::fs::canonicalize(&site_root).unwrap_or(site_root);

        let renderer = Renderer::new(Arc::clone(&config), self.modules, self.islands);
        let table = build_table(&site_root, &config, &renderer)?;
        for route in table.iter().filter(|r| r.kind() == RouteKind::Page) {
            if !renderer.modules().contains(route.rel_path()) {
                warn!(
                    file = route.rel_path(),
                    url = route.url_path(),
                    "route has no registered module"
                );
            }
        }

        let hydration = match self.transpiler {
            Some(transpiler) => HydrationModuleCache::new(transpiler),
            None => HydrationModuleCache::default(),
        };
        let (hmr, _) = broadcast::channel(HMR_CAPACITY);
        let assets = StaticFiles::new(
            site_root.clone(),
            self.root.join(&config.dist_dir),
            config.routes.file_extensions.clone(),
        );

        Ok(App {
            inner: Arc::new(AppInner {
                config,
                mode: self.mode,
                root: self.root,
                site_root,
                routes: ArcSwap::from_pointee(table),
                renderer,
                hydration,
                api: self.api,
                middleware: self.middleware,
                assets,
                store: self.store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
                hmr,
            }),
        })
    }
}

struct AppInner {
    config: Arc<FrameworkConfig>,
    mode: AppMode,
    root: PathBuf,
    site_root: PathBuf,
    routes: ArcSwap<RouteTable>,
    renderer: Renderer,
    hydration: HydrationModuleCache,
    api: ApiRegistry,
    middleware: Vec<MiddlewareHandler>,
    assets: StaticFiles,
    store: Arc<dyn Store>,
    hmr: broadcast::Sender<HmrEvent>,
}

/// A configured site, ready to answer requests. Cloning is cheap and shares state.
#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

impl App {
    pub fn builder(config: FrameworkConfig) -> AppBuilder {
        AppBuilder {
            config,
            root: PathBuf::from("."),
            mode: AppMode::Prod,
            modules: ModuleRegistry::new(),
            islands: IslandRegistry::new(),
            api: ApiRegistry::new(),
            middleware: Vec::new(),
            store: None,
            transpiler: None,
        }
    }

    pub fn config(&self) -> &FrameworkConfig {
        &self.inner.config
    }

    pub fn mode(&self) -> AppMode {
        self.inner.mode
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn site_root(&self) -> &Path {
        &self.inner.site_root
    }

    /// The current route table. Dev-mode rescans replace it atomically.
    pub fn routes(&self) -> Arc<RouteTable> {
        self.inner.routes.load_full()
    }

    pub fn renderer(&self) -> &Renderer {
        &self.inner.renderer
    }

    pub fn hydration_modules(&self) -> &HydrationModuleCache {
        &self.inner.hydration
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    /// A receiver for HMR events published by the dev watcher.
    pub fn subscribe_hmr(&self) -> broadcast::Receiver<HmrEvent> {
        self.inner.hmr.subscribe()
    }

    /// Publishes `event` to every connected HMR client. Returns the number reached.
    pub fn publish_hmr(&self, event: HmrEvent) -> usize {
        self.inner.hmr.send(event).unwrap_or(0)
    }

    /// Re-scans the site directory and swaps in the new table.
    ///
    /// On failure the previous table stays in place.
    ///
    /// # Errors
    ///
    /// Any [`ScanError`] from the scan.
    pub fn rescan(&self) -> Result<usize, ScanError> {
        let table = build_table(&self.inner.site_root, &self.inner.config, &self.inner.renderer)?;
        let count = table.len();
        self.inner.routes.store(Arc::new(table));
        info!(routes = count, "route table reloaded");
        Ok(count)
    }

    /// Answers one request. Never fails: errors become 500 responses.
    pub async fn handle(&self, request: Request) -> Response {
        let started = Instant::now();
        let response = match self.dispatch(&request).await {
            Ok(response) => response,
            Err(e) => self.error_response(&request, &e),
        };
        info!(
            method = %request.method(),
            path = %request.path(),
            status = response.status().as_u16(),
            duration_ms = started.elapsed().as_millis() as u64,
            "request"
        );
        response
    }

    /// `true` when `request` opens the dev HMR event stream.
    pub fn is_hmr_request(&self, request: &Request) -> bool {
        self.inner.mode.is_dev() && request.path() == HMR_PATH
    }

    /// Renders every parameterless SSG and ISR route into the page cache.
    ///
    /// Returns the URL paths rendered with their documents, in table order.
    ///
    /// # Errors
    ///
    /// The first [`RenderError`] encountered.
    pub async fn prerender(&self) -> Result<Vec<(String, Arc<str>)>, AppError> {
        let table = self.routes();
        let mut rendered = Vec::new();
        for route in table.iter().filter(|r| r.is_static()) {
            match route.render_mode() {
                RenderMode::Ssg | RenderMode::Isr => {}
                mode => {
                    debug!(url = route.url_path(), mode = %mode, "skipping prerender");
                    continue;
                }
            }
            let html = self
                .inner
                .renderer
                .prerender(route, Arc::clone(&self.inner.store))
                .await?;
            rendered.push((route.url_path().to_owned(), html));
        }
        info!(pages = rendered.len(), "prerendered");
        Ok(rendered)
    }

    async fn dispatch(&self, request: &Request) -> Result<Response, AppError> {
        match request.path() {
            ISLANDS_RUNTIME_PATH => return Ok(Response::javascript(ISLANDS_RUNTIME)),
            HYDRATE_RUNTIME_PATH => return Ok(Response::javascript(HYDRATE_RUNTIME)),
            HYDRATE_PATH => return self.hydration_module(request).await,
            _ => {}
        }

        let prefix = self.inner.config.api.prefix.as_str();
        let path = request.path();
        if path.starts_with(prefix) || path == prefix.trim_end_matches('/') {
            return self.api(prefix, request).await;
        }

        if request.method().is_read_only() {
            if let Some(file) = self.inner.assets.serve(path).await {
                return Ok(file);
            }
        }

        self.page(request).await
    }

    async fn api(&self, prefix: &str, request: &Request) -> Result<Response, AppError> {
        let store = Arc::clone(&self.inner.store);
        let mut ctx = MiddlewareContext::new(request, Params::new(), Arc::clone(&store));
        if let ChainOutcome::ShortCircuited(kind) =
            middleware::execute(&self.inner.middleware, &mut ctx).await?
        {
            debug!(path = request.path(), kind = ?kind, "app middleware answered");
            return Ok(ctx.into_response());
        }

        let mut response = self.inner.api.dispatch(prefix, request, store).await;
        for (name, value) in ctx.response().headers().iter() {
            if !response.headers().contains(name) {
                response.set_header(name, value);
            }
        }
        Ok(response)
    }

    async fn hydration_module(&self, request: &Request) -> Result<Response, AppError> {
        let Some(file) = request.query_param("file") else {
            return Ok(Response::text(StatusCode::BadRequest, "missing file"));
        };
        let path = match resolve_site_file(&self.inner.site_root, file) {
            Ok(path) => path,
            Err(e) => return Ok(Response::text(StatusCode::BadRequest, e.to_string())),
        };
        match self.inner.hydration.get_or_build(&path).await {
            Ok(code) => {
                Ok(Response::javascript(code.to_string()).header("Cache-Control", "no-store"))
            }
            Err(TranspileError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(Response::text(StatusCode::NotFound, format!("{file} not found")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn page(&self, request: &Request) -> Result<Response, AppError> {
        let table = self.routes();
        let Some(matched) = table.match_path(request.path()) else {
            return Ok(not_found());
        };
        let route = matched.route;
        let store = Arc::clone(&self.inner.store);
        let mut ctx = MiddlewareContext::new(request, matched.params, store);

        // App middleware sees every method so a CORS preflight can answer.
        if let ChainOutcome::ShortCircuited(kind) =
            middleware::execute(&self.inner.middleware, &mut ctx).await?
        {
            debug!(route = route.url_path(), kind = ?kind, "app middleware answered");
            return Ok(ctx.into_response());
        }
        if !request.method().is_read_only() {
            return Ok(Response::text(StatusCode::MethodNotAllowed, "405 Method Not Allowed")
                .header("Allow", "GET, HEAD"));
        }

        let module = self.inner.renderer.module(route)?;
        if let ChainOutcome::ShortCircuited(kind) =
            middleware::execute(&module.middleware(), &mut ctx).await?
        {
            debug!(route = route.url_path(), kind = ?kind, "middleware answered");
            return Ok(ctx.into_response());
        }

        let document = self.inner.renderer.render(route, ctx.to_loader_context()).await?;
        let html = if self.inner.mode.is_dev() {
            inject_hmr(&document.html)
        } else {
            document.html.to_string()
        };

        let mut response = ctx.into_response();
        response.set_header("Content-Type", "text/html; charset=utf-8");
        response.set_header("X-Render-Mode", document.mode.as_str());
        response.set_header("X-Cache", document.cache.as_str());
        response.set_body(html);
        Ok(response)
    }

    fn error_response(&self, request: &Request, e: &AppError) -> Response {
        error!(method = %request.method(), path = %request.path(), error = %e, "request failed");
        let mut body = String::from("500 Internal Server Error");
        if self.inner.mode.is_dev() {
            body.push_str("\n\n");
            body.push_str(&e.to_string());
            let mut source = e.source();
            while let Some(cause) = source {
                body.push_str("\n  caused by: ");
                body.push_str(&cause.to_string());
                source = cause.source();
            }
        }
        Response::text(StatusCode::InternalServerError, body)
    }
}

fn build_table(
    site_root: &Path,
    config: &FrameworkConfig,
    renderer: &Renderer,
) -> Result<RouteTable, ScanError> {
    let mut table = scan_routes(site_root, config)?;
    table.apply_modes(|route| renderer.effective_mode(route));
    Ok(table)
}

fn not_found() -> Response {
    Response::text(StatusCode::NotFound, "404 Not Found")
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("mode", &self.inner.mode)
            .field("site_root", &self.inner.site_root)
            .field("routes", &self.inner.routes.load().len())
            .field("modules", self.inner.renderer.modules())
            .field("api", &self.inner.api)
            .finish_non_exhaustive()
    }
}

//! The route module contract and its registry.
//!
//! Each route file is backed by a [`RouteModule`] registered under the file's
//! site-relative path (`blog/[slug].tsx`). The module renders the page body,
//! optionally contributes `<head>` markup, loads data, lists middleware and
//! overrides the configured render mode.
//!
//! [`Page`] builds a module from closures, in the same spirit as handler
//! closures elsewhere in the crate:
//!
//! ```
//! use islet::render::module::{Page, PageProps};
//! use islet::render::view::Node;
//! use serde_json::json;
//!
//! let page = Page::new(|props: &PageProps| {
//!     Ok(Node::element("h1").child(Node::text(props.data["title"].as_str().unwrap_or(""))))
//! })
//! .with_loader(|_ctx| async { Ok(json!({"title": "Hello"})) });
//! # let _ = page;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use super::{LoaderError, RenderError};
use crate::BoxFuture;
use crate::config::RenderMode;
use crate::context::{LoaderContext, Params};
use crate::middleware::MiddlewareHandler;
use crate::render::view::Node;

/// What a page's `render` and `head` receive.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageProps {
    pub data: Value,
    pub params: Params,
    pub query: BTreeMap<String, String>,
}

/// A route's server-side implementation.
pub trait RouteModule: Send + Sync {
    /// Renders the page body.
    fn render(&self, props: &PageProps) -> Result<Node, RenderError>;

    /// Extra `<head>` markup.
    fn head(&self, _props: &PageProps) -> Option<Node> {
        None
    }

    /// Loads the page data. Defaults to `null`.
    fn loader<'a>(&'a self, _ctx: &'a LoaderContext) -> BoxFuture<'a, Result<Value, LoaderError>> {
        Box::pin(async { Ok(Value::Null) })
    }

    /// Middleware run before the loader, in order.
    fn middleware(&self) -> Vec<MiddlewareHandler> {
        Vec::new()
    }

    /// Overrides the configured default render mode.
    fn mode(&self) -> Option<RenderMode> {
        None
    }

    /// Overrides the configured ISR window.
    fn revalidate_seconds(&self) -> Option<u64> {
        None
    }

    /// Whether the page hydration bootstrap is emitted.
    fn hydrate(&self) -> bool {
        true
    }
}

/// Conversion trait for async loader closures taking an owned context.
pub trait IntoLoader: Send + Sync + 'static {
    fn call(&self, ctx: LoaderContext) -> BoxFuture<'static, Result<Value, LoaderError>>;
}

impl<T, F> IntoLoader for T
where
    T: Fn(LoaderContext) -> F + Send + Sync + 'static,
    F: Future<Output = Result<Value, LoaderError>> + Send + 'static,
{
    fn call(&self, ctx: LoaderContext) -> BoxFuture<'static, Result<Value, LoaderError>> {
        Box::pin((self)(ctx))
    }
}

type RenderFn = Arc<dyn Fn(&PageProps) -> Result<Node, RenderError> + Send + Sync>;
type HeadFn = Arc<dyn Fn(&PageProps) -> Node + Send + Sync>;

/// A [`RouteModule`] assembled from closures.
#[derive(Clone)]
pub struct Page {
    render: RenderFn,
    head: Option<HeadFn>,
    loader: Option<Arc<dyn IntoLoader>>,
    middleware: Vec<MiddlewareHandler>,
    mode: Option<RenderMode>,
    revalidate_seconds: Option<u64>,
    hydrate: bool,
}

impl Page {
    pub fn new<F>(render: F) -> Self
    where
        F: Fn(&PageProps) -> Result<Node, RenderError> + Send + Sync + 'static,
    {
        Self {
            render: Arc::new(render),
            head: None,
            loader: None,
            middleware: Vec::new(),
            mode: None,
            revalidate_seconds: None,
            hydrate: true,
        }
    }

    #[must_use]
    pub fn with_head<F>(mut self, head: F) -> Self
    where
        F: Fn(&PageProps) -> Node + Send + Sync + 'static,
    {
        self.head = Some(Arc::new(head));
        self
    }

    #[must_use]
    pub fn with_loader<F, Fut>(mut self, loader: F) -> Self
    where
        F: Fn(LoaderContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, LoaderError>> + Send + 'static,
    {
        self.loader = Some(Arc::new(loader));
        self
    }

    #[must_use]
    pub fn with_middleware(mut self, middleware: MiddlewareHandler) -> Self {
        self.middleware.push(middleware);
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: RenderMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Switches the page to ISR with the given window.
    #[must_use]
    pub fn revalidate(mut self, seconds: u64) -> Self {
        self.mode = Some(RenderMode::Isr);
        self.revalidate_seconds = Some(seconds);
        self
    }

    #[must_use]
    pub fn without_hydration(mut self) -> Self {
        self.hydrate = false;
        self
    }
}

impl RouteModule for Page {
    fn render(&self, props: &PageProps) -> Result<Node, RenderError> {
        (self.render)(props)
    }

    fn head(&self, props: &PageProps) -> Option<Node> {
        self.head.as_ref().map(|head| head(props))
    }

    fn loader<'a>(&'a self, ctx: &'a LoaderContext) -> BoxFuture<'a, Result<Value, LoaderError>> {
        match &self.loader {
            Some(loader) => loader.call(ctx.clone()),
            None => Box::pin(async { Ok(Value::Null) }),
        }
    }

    fn middleware(&self) -> Vec<MiddlewareHandler> {
        self.middleware.clone()
    }

    fn mode(&self) -> Option<RenderMode> {
        self.mode
    }

    fn revalidate_seconds(&self) -> Option<u64> {
        self.revalidate_seconds
    }

    fn hydrate(&self) -> bool {
        self.hydrate
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("has_head", &self.head.is_some())
            .field("has_loader", &self.loader.is_some())
            .field("middleware", &self.middleware.len())
            .field("mode", &self.mode)
            .field("revalidate_seconds", &self.revalidate_seconds)
            .field("hydrate", &self.hydrate)
            .finish()
    }
}

/// Route modules keyed by site-relative route file path.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, Arc<dyn RouteModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `module` for the route file at `rel_path` (forward slashes).
    pub fn register(
        &mut self,
        rel_path: impl Into<String>,
        module: impl RouteModule + 'static,
    ) -> &mut Self {
        self.modules.insert(rel_path.into(), Arc::new(module));
        self
    }

    pub fn get(&self, rel_path: &str) -> Option<&Arc<dyn RouteModule>> {
        self.modules.get(rel_path)
    }

    pub fn contains(&self, rel_path: &str) -> bool {
        self.modules.contains_key(rel_path)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.modules.keys().collect();
        keys.sort();
        f.debug_struct("ModuleRegistry").field("modules", &keys).finish()
    }
}

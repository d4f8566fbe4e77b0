//! Render orchestration: loader, view tree, document assembly and render-mode
//! policy.
//!
//! ```text
//! RouteEntry + LoaderContext
//!     → RouteModule::loader            (async, may fail → RenderError::Loader)
//!     → RouteModule::render            (view tree; islands resolved by name)
//!     → HtmlWriter                     (HTML + island markers)
//!     → document()                     (head, #app, data payload, bootstrap)
//!     → mode policy                    (ssr fresh | ssg/isr page cache | ppr shell + regions)
//! ```
//!
//! Cached output (SSG and ISR pages, PPR shells) is rendered against
//! [`LoaderContext::shared`], so it only depends on the route and its params.
//! The query of the request being answered is written into the data payload on
//! every hit.

pub mod module;
pub mod view;

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{CachedPage, PageCache, ShellCache, StaticPage, cache_key};
use crate::config::{FrameworkConfig, RenderMode};
use crate::context::{LoaderContext, Params, Store};
use crate::http::request::encode_component;
use crate::http::{Method, Request};
use crate::islands::{IslandRegistry, MarkerError, escape_json};
use crate::router::RouteEntry;

use module::{ModuleRegistry, PageProps, RouteModule};
use view::{DynamicRender, HtmlWriter, IslandIds, Regions, ppr_end, ppr_start, render_to_string};

const PAYLOAD_OPEN: &str = r#"<script type="application/json" id="__FRAMEWORK_DATA__">"#;

/// Failure raised by a route loader.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl LoaderError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

/// Failure to produce a page.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("loader failed: {0}")]
    Loader(#[from] LoaderError),

    #[error("no module registered for route file {0}")]
    MissingModule(String),

    #[error("unknown island `{0}`")]
    UnknownIsland(String),

    #[error("invalid island marker: {0}")]
    Marker(#[from] MarkerError),

    #[error("island id `{0}` is used more than once")]
    DuplicateIslandId(String),

    #[error("dynamic region `{0}` is used more than once")]
    DuplicateRegion(String),

    #[error("render failed: {0}")]
    Component(String),
}

impl RenderError {
    pub fn component(message: impl Into<String>) -> Self {
        Self::Component(message.into())
    }
}

/// Where a document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Rendered for this request and not cached.
    Bypass,
    /// Rendered for this request and cached.
    Miss,
    /// Served from cache.
    Hit,
    /// Served from cache past its window; a background refresh was requested.
    Stale,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bypass => "BYPASS",
            Self::Miss => "MISS",
            Self::Hit => "HIT",
            Self::Stale => "STALE",
        }
    }
}

/// A rendered page.
#[derive(Debug, Clone)]
pub struct RenderedDocument {
    pub html: Arc<str>,
    pub mode: RenderMode,
    pub cache: CacheStatus,
}

/// A prerendered PPR shell: everything static, dynamic regions as fallbacks.
struct PprShell {
    head: String,
    body: String,
    props: PageProps,
    regions: Vec<(String, DynamicRender)>,
    ids: IslandIds,
    has_islands: bool,
    hydrate: bool,
}

struct RendererInner {
    config: Arc<FrameworkConfig>,
    modules: ModuleRegistry,
    islands: IslandRegistry,
    pages: PageCache,
    shells: ShellCache<PprShell>,
}

/// Renders routes according to their render mode. Cloning shares the caches.
#[derive(Clone)]
pub struct Renderer {
    inner: Arc<RendererInner>,
}

impl Renderer {
    pub fn new(
        config: Arc<FrameworkConfig>,
        modules: ModuleRegistry,
        islands: IslandRegistry,
    ) -> Self {
        Self {
            inner: Arc::new(RendererInner {
                config,
                modules,
                islands,
                pages: PageCache::new(),
                shells: ShellCache::new(),
            }),
        }
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.inner.modules
    }

    pub fn islands(&self) -> &IslandRegistry {
        &self.inner.islands
    }

    pub fn page_cache(&self) -> &PageCache {
        &self.inner.pages
    }

    /// The module registered for `route`.
    ///
    /// # Errors
    ///
    /// [`RenderError::MissingModule`] when nothing is registered under the
    /// route's file.
    pub fn module(&self, route: &RouteEntry) -> Result<Arc<dyn RouteModule>, RenderError> {
        self.inner
            .modules
            .get(route.rel_path())
            .cloned()
            .ok_or_else(|| RenderError::MissingModule(route.rel_path().to_owned()))
    }

    /// Render mode and ISR window for `route`, module overrides applied.
    pub fn effective_mode(&self, route: &RouteEntry) -> (RenderMode, u64) {
        match self.inner.modules.get(route.rel_path()) {
            Some(module) => (
                module.mode().unwrap_or(route.render_mode()),
                module
                    .revalidate_seconds()
                    .unwrap_or(route.revalidate_seconds()),
            ),
            None => (route.render_mode(), route.revalidate_seconds()),
        }
    }

    /// Drops every cached page and shell.
    pub fn invalidate_all(&self) {
        self.inner.pages.clear();
        self.inner.shells.clear();
    }

    /// Renders `route` for one request, applying its render mode.
    ///
    /// # Errors
    ///
    /// Any [`RenderError`] from the module, its loader or island resolution.
    /// Background ISR failures are logged, never returned.
    pub async fn render(
        &self,
        route: &RouteEntry,
        ctx: LoaderContext,
    ) -> Result<RenderedDocument, RenderError> {
        let module = self.module(route)?;
        let (mode, revalidate) = self.effective_mode(route);
        let key = cache_key(route.id(), ctx.params());

        let (html, cache) = match mode {
            RenderMode::Ssr => {
                let page = self.render_fresh(route, module.as_ref(), &ctx).await?;
                (Arc::from(page.html), CacheStatus::Bypass)
            }
            RenderMode::Ssg => match self.inner.pages.get(&key) {
                Some(page) => (for_request(&page, &ctx), CacheStatus::Hit),
                None => (self.fill(route, module.as_ref(), &ctx, &key).await?, CacheStatus::Miss),
            },
            RenderMode::Isr => match self.inner.pages.get(&key) {
                Some(page) if page.is_stale(Duration::from_secs(revalidate), Instant::now()) => {
                    self.spawn_revalidation(route, module, ctx.shared(), &key);
                    (for_request(&page, &ctx), CacheStatus::Stale)
                }
                Some(page) => (for_request(&page, &ctx), CacheStatus::Hit),
                None => (self.fill(route, module.as_ref(), &ctx, &key).await?, CacheStatus::Miss),
            },
            RenderMode::Ppr => {
                let (html, cache) = self.render_ppr(route, module.as_ref(), &ctx, &key).await?;
                (Arc::from(html), cache)
            }
        };

        debug!(
            route = %route.url_path(),
            key = %key,
            mode = %mode,
            cache = cache.as_str(),
            "rendered"
        );
        Ok(RenderedDocument { html, mode, cache })
    }

    // Renders a page cache miss from the shared context and answers `ctx` from it.
    async fn fill(
        &self,
        route: &RouteEntry,
        module: &dyn RouteModule,
        ctx: &LoaderContext,
        key: &str,
    ) -> Result<Arc<str>, RenderError> {
        let page = self.render_fresh(route, module, &ctx.shared()).await?;
        Ok(for_request(&self.inner.pages.insert(key, page), ctx))
    }

    /// Renders a parameterless route into the page cache, as at build time.
    ///
    /// # Errors
    ///
    /// Any [`RenderError`] from the module.
    pub async fn prerender(
        &self,
        route: &RouteEntry,
        store: Arc<dyn Store>,
    ) -> Result<Arc<str>, RenderError> {
        let module = self.module(route)?;
        let request = Request::new(Method::Get, route.url_path());
        let ctx = LoaderContext::from_request(&request, Params::new(), store).shared();
        let page = self.render_fresh(route, module.as_ref(), &ctx).await?;
        let key = cache_key(route.id(), &Params::new());
        Ok(self.inner.pages.insert(key, page).html)
    }

    fn spawn_revalidation(
        &self,
        route: &RouteEntry,
        module: Arc<dyn RouteModule>,
        ctx: LoaderContext,
        key: &str,
    ) {
        let Some(guard) = self.inner.pages.begin_revalidation(key) else {
            return;
        };
        let renderer = self.clone();
        let route = route.clone();
        tokio::spawn(async move {
            match renderer.render_fresh(&route, module.as_ref(), &ctx).await {
                Ok(page) => {
                    renderer.inner.pages.insert(guard.key(), page);
                    info!(route = %route.url_path(), key = guard.key(), "page revalidated");
                }
                Err(e) => {
                    warn!(
                        route = %route.url_path(),
                        key = guard.key(),
                        error = %e,
                        "revalidation failed, keeping stale page"
                    );
                }
            }
        });
    }

    async fn render_fresh(
        &self,
        route: &RouteEntry,
        module: &dyn RouteModule,
        ctx: &LoaderContext,
    ) -> Result<StaticPage, RenderError> {
        let props = load_props(module, ctx).await?;
        let body = module.render(&props)?;

        let mut writer = HtmlWriter::new(&self.inner.islands, Regions::Inline(ctx));
        writer.write(&body)?;
        let out = writer.finish();

        let head = self.render_head(module, &props);
        let has_islands = !out.islands.is_empty();
        let (html, payload) =
            self.document(route, &head, &out.html, &props, has_islands, module.hydrate());
        Ok(StaticPage {
            html,
            payload,
            data: props.data,
        })
    }

    async fn render_ppr(
        &self,
        route: &RouteEntry,
        module: &dyn RouteModule,
        ctx: &LoaderContext,
        key: &str,
    ) -> Result<(String, CacheStatus), RenderError> {
        let (shell, cache) = match self.inner.shells.get(key) {
            Some(shell) => (shell, CacheStatus::Hit),
            None => {
                let shell = self.build_shell(module, &ctx.shared()).await?;
                (self.inner.shells.insert(key, shell), CacheStatus::Miss)
            }
        };

        let mut body = shell.body.clone();
        let mut ids = shell.ids.clone();
        let mut has_islands = shell.has_islands;
        for (id, render) in &shell.regions {
            let node = render(ctx);
            let mut writer =
                HtmlWriter::new(&self.inner.islands, Regions::Inline(ctx)).with_ids(ids);
            writer.write(&node)?;
            let out = writer.finish();
            ids = out.ids;
            has_islands |= !out.islands.is_empty();
            body = splice_region(&body, id, &out.html);
        }

        let props = PageProps {
            data: shell.props.data.clone(),
            params: ctx.params().clone(),
            query: ctx.query().clone(),
        };
        let (html, _) =
            self.document(route, &shell.head, &body, &props, has_islands, shell.hydrate);
        Ok((html, cache))
    }

    async fn build_shell(
        &self,
        module: &dyn RouteModule,
        ctx: &LoaderContext,
    ) -> Result<PprShell, RenderError> {
        let props = load_props(module, ctx).await?;
        let body = module.render(&props)?;
        let mut writer = HtmlWriter::new(&self.inner.islands, Regions::Shell(Vec::new()));
        writer.write(&body)?;
        let out = writer.finish();
        Ok(PprShell {
            head: self.render_head(module, &props),
            body: out.html,
            regions: out.regions,
            ids: out.ids,
            has_islands: !out.islands.is_empty(),
            hydrate: module.hydrate(),
            props,
        })
    }

    fn render_head(&self, module: &dyn RouteModule, props: &PageProps) -> String {
        let Some(node) = module.head(props) else {
            return String::new();
        };
        render_to_string(&node, &self.inner.islands).unwrap_or_else(|e| {
            warn!(error = %e, "head render failed, omitting module head");
            String::new()
        })
    }

    fn document(
        &self,
        route: &RouteEntry,
        head: &str,
        body: &str,
        props: &PageProps,
        has_islands: bool,
        hydrate: bool,
    ) -> (String, Range<usize>) {
        let inject = &self.inner.config.inject;
        let mut html = String::from("<!doctype html>\n<html>\n<head>\n");
        for entry in &inject.head {
            line(&mut html, entry);
        }
        if !head.is_empty() {
            line(&mut html, head);
        }
        line(&mut html, r#"<link rel="stylesheet" href="/styles.css">"#);
        line(&mut html, "</head>\n<body>");
        line(&mut html, &format!(r#"<div id="app">{body}</div>"#));

        html.push_str(PAYLOAD_OPEN);
        let start = html.len();
        html.push_str(&payload_json(props));
        let payload = start..html.len();
        line(&mut html, "</script>");

        for entry in &inject.body_end {
            line(&mut html, entry);
        }
        if hydrate {
            if has_islands {
                line(&mut html, r#"<script type="module" src="/__runtime/islands.js"></script>"#);
            }
            let entry = format!("/__hydrate?file={}", encode_component(route.rel_path()));
            let entry = serde_json::to_string(&entry).unwrap_or_else(|_| "\"\"".to_owned());
            line(
                &mut html,
                &format!(
                    "<script type=\"module\">\n\
                     import {{ hydrateClient }} from \"/__runtime/hydrate.js\";\n\
                     hydrateClient({entry});\n\
                     </script>"
                ),
            );
        }
        html.push_str("</body>\n</html>");
        (html, payload)
    }
}

fn line(html: &mut String, text: &str) {
    html.push_str(text);
    html.push('\n');
}

// A cached page as served to `ctx`: the stored HTML when the request has no
// query, otherwise the same page with the request's query in its payload.
fn for_request(page: &CachedPage, ctx: &LoaderContext) -> Arc<str> {
    if ctx.query().is_empty() {
        return Arc::clone(&page.html);
    }
    let props = PageProps {
        data: page.data.clone(),
        params: ctx.params().clone(),
        query: ctx.query().clone(),
    };
    Arc::from(page.with_payload(&payload_json(&props)))
}

async fn load_props(
    module: &dyn RouteModule,
    ctx: &LoaderContext,
) -> Result<PageProps, RenderError> {
    let data = module.loader(ctx).await?;
    Ok(PageProps {
        data,
        params: ctx.params().clone(),
        query: ctx.query().clone(),
    })
}

/// Serializes the `__FRAMEWORK_DATA__` payload so it cannot close its script
/// element or break inline JavaScript.
pub fn payload_json(props: &PageProps) -> String {
    let json = serde_json::to_string(props).unwrap_or_else(|_| "null".to_owned());
    escape_json(&json)
        .replace('&', "\\u0026")
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029")
}

fn splice_region(shell: &str, id: &str, html: &str) -> String {
    let start = ppr_start(id);
    let end = ppr_end(id);
    let Some(open) = shell.find(&start) else {
        return shell.to_owned();
    };
    let content_start = open + start.len();
    let Some(close) = shell[content_start..].find(&end) else {
        return shell.to_owned();
    };
    let content_end = content_start + close;
    format!("{}{}{}", &shell[..content_start], html, &shell[content_end..])
}

/// Parses the payload back out of a rendered document.
pub fn extract_payload(html: &str) -> Option<Value> {
    let start = html.find(PAYLOAD_OPEN)? + PAYLOAD_OPEN.len();
    let len = html[start..].find("</script>")?;
    serde_json::from_str(&html[start..start + len]).ok()
}

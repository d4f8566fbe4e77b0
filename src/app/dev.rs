//! Development mode: site watcher and hot reload.
//!
//! ```text
//! notify event (watcher thread)
//!     → mpsc → debounce (100 ms)
//!     → apply_changes
//!          ├─ .css / .scss  → HmrEvent::StyleUpdate
//!          └─ anything else → drop hydration module, clear page caches,
//!                             rescan routes, HmrEvent::Reload
//!     → broadcast → /__hmr subscribers (SSE)
//! ```

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{App, AppError};

/// Quiet period before a burst of file events is applied.
pub const DEBOUNCE: Duration = Duration::from_millis(100);

/// First frame written to a new HMR stream.
pub const SSE_CONNECTED: &str = "data: connected\n\n";

/// A hot-reload notification for connected browsers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HmrEvent {
    /// Reload the page.
    Reload,
    /// Re-fetch stylesheets whose path ends with `file`.
    StyleUpdate { file: String },
}

impl HmrEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Reload => "reload",
            Self::StyleUpdate { .. } => "style-update",
        }
    }

    /// Formats the event as one server-sent-events frame.
    ///
    /// # Examples
    ///
    /// ```
    /// use islet::app::dev::HmrEvent;
    ///
    /// assert_eq!(HmrEvent::Reload.to_sse(), "event: reload\ndata: {}\n\n");
    /// let style = HmrEvent::StyleUpdate { file: "styles.css".into() };
    /// assert_eq!(style.to_sse(), "event: style-update\ndata: {\"file\":\"styles.css\"}\n\n");
    /// ```
    pub fn to_sse(&self) -> String {
        let data = match self {
            Self::Reload => json!({}),
            Self::StyleUpdate { file } => json!({ "file": file }),
        };
        format!("event: {}\ndata: {data}\n\n", self.name())
    }
}

/// Browser side of the HMR channel, injected into dev documents.
pub const HMR_CLIENT_SCRIPT: &str = r#"(function () {
  const source = new EventSource("/__hmr");
  source.onopen = () => console.debug("[islet] hmr connected");
  source.addEventListener("reload", () => window.location.reload());
  source.addEventListener("style-update", (event) => {
    const file = JSON.parse(event.data).file;
    for (const link of document.querySelectorAll('link[rel="stylesheet"]')) {
      const url = new URL(link.href);
      if (url.pathname.endsWith(file)) {
        url.searchParams.set("t", Date.now());
        link.href = url.toString();
      }
    }
  });
})();"#;

/// Inserts the HMR client before the last `</body>`, or appends it when the
/// document has none.
pub fn inject_hmr(html: &str) -> String {
    let script = format!("<script>{HMR_CLIENT_SCRIPT}</script>");
    match html.rfind("</body>") {
        Some(at) => format!("{}{script}{}", &html[..at], &html[at..]),
        None => format!("{html}{script}"),
    }
}

/// `true` for editor backups, temp files, hidden paths and `node_modules`.
pub fn is_ignored(rel: &Path) -> bool {
    let hidden_or_vendor = rel.components().any(|c| match c {
        Component::Normal(name) => {
            let name = name.to_string_lossy();
            name.starts_with('.') || name == "node_modules"
        }
        _ => false,
    });
    let name = rel.to_string_lossy();
    hidden_or_vendor || name.ends_with('~') || name.ends_with(".tmp")
}

fn style_file(rel: &Path) -> Option<String> {
    let ext = rel.extension()?.to_str()?;
    if ext != "css" && ext != "scss" {
        return None;
    }
    let file = rel.with_extension("css");
    Some(file.to_string_lossy().replace('\\', "/"))
}

// Removed files cannot be canonicalized, so fall back to their parent.
fn canonical(path: &Path) -> PathBuf {
    if let Ok(path) = std::fs::canonicalize(path) {
        return path;
    }
    match (path.parent().map(std::fs::canonicalize), path.file_name()) {
        (Some(Ok(parent)), Some(name)) => parent.join(name),
        _ => path.to_path_buf(),
    }
}

/// Applies a batch of changed paths (absolute, under the site root) and
/// publishes the resulting events. Paths outside the site are skipped. Returns what was published.
pub fn apply_changes(app: &App, paths: impl IntoIterator<Item = PathBuf>) -> Vec<HmrEvent> {
    let site_root = app.site_root();
    let mut events = Vec::new();
    let mut reload = false;

    for path in paths {
        let path = canonical(&path);
        let Ok(rel) = path.strip_prefix(site_root) else {
            debug!(file = %path.display(), "change outside the site ignored");
            continue;
        };
        if is_ignored(rel) {
            continue;
        }
        info!(file = %rel.display(), "change detected");
        match style_file(rel) {
            Some(file) => events.push(HmrEvent::StyleUpdate { file }),
            None => {
                app.hydration_modules().invalidate(&path);
                reload = true;
            }
        }
    }

    if reload {
        app.renderer().invalidate_all();
        if let Err(e) = app.rescan() {
            warn!(error = %e, "rescan failed, keeping previous routes");
        }
        events.push(HmrEvent::Reload);
    }

    for event in &events {
        let clients = app.publish_hmr(event.clone());
        debug!(event = event.name(), clients, "hmr event published");
    }
    events
}

/// A running site watcher. Dropping it stops watching.
pub struct DevWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for DevWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Starts watching the app's site directory.
///
/// Must be called from within a tokio runtime.
///
/// # Errors
///
/// [`AppError::Watch`] when the watcher cannot be created or attached.
pub fn watch(app: &App) -> Result<DevWatcher, AppError> {
    let (tx, rx) = mpsc::unbounded_channel::<PathBuf>();

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) if !event.kind.is_access() => {
                for path in event.paths {
                    let _ = tx.send(path);
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "watch error"),
        },
        Config::default(),
    )?;
    watcher.watch(app.site_root(), RecursiveMode::Recursive)?;
    info!(path = %app.site_root().display(), "watching site for changes");

    let task = tokio::spawn(debounce_loop(app.clone(), rx));
    Ok(DevWatcher {
        _watcher: watcher,
        task,
    })
}

async fn debounce_loop(app: App, mut rx: mpsc::UnboundedReceiver<PathBuf>) {
    while let Some(first) = rx.recv().await {
        let mut batch = BTreeSet::from([first]);
        let deadline = tokio::time::sleep(DEBOUNCE);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                next = rx.recv() => match next {
                    Some(path) => {
                        batch.insert(path);
                    }
                    None => break,
                },
            }
        }
        apply_changes(&app, batch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppMode, FrameworkConfig};
    use crate::http::{Method, Request, StatusCode};
    use crate::render::module::Page;
    use crate::render::view::Node;
    use std::fs;

    fn dev_app(root: &Path) -> App {
        App::builder(FrameworkConfig::default())
            .root(root)
            .mode(AppMode::Dev)
            .page("(index).tsx", Page::new(|_| Ok(Node::text("home"))))
            .page("(about).tsx", Page::new(|_| Ok(Node::text("about"))))
            .build()
            .unwrap()
    }

    #[test]
    fn ignores_hidden_and_temp_files() {
        assert!(is_ignored(Path::new(".git/HEAD")));
        assert!(is_ignored(Path::new("blog/.draft.tsx")));
        assert!(is_ignored(Path::new("node_modules/x/index.js")));
        assert!(is_ignored(Path::new("(index).tsx~")));
        assert!(is_ignored(Path::new("out.tmp")));
        assert!(!is_ignored(Path::new("blog/[slug].tsx")));
    }

    #[test]
    fn scss_maps_to_css() {
        assert_eq!(
            style_file(Path::new("theme/site.scss")).as_deref(),
            Some("theme/site.css")
        );
        assert_eq!(style_file(Path::new("styles.css")).as_deref(), Some("styles.css"));
        assert_eq!(style_file(Path::new("(index).tsx")), None);
    }

    #[test]
    fn hmr_script_goes_before_body_close() {
        let html = inject_hmr("<html><body><p>x</p></body></html>");
        assert!(html.ends_with("</script></body></html>"));
        assert!(html.contains("new EventSource(\"/__hmr\")"));
        assert!(inject_hmr("<p>fragment</p>").starts_with("<p>fragment</p><script>"));
    }

    #[tokio::test]
    async fn style_change_publishes_style_update_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("site")).unwrap();
        fs::write(dir.path().join("site/(index).tsx"), "").unwrap();
        let app = dev_app(dir.path());
        let mut rx = app.subscribe_hmr();

        let events = apply_changes(&app, [app.site_root().join("styles.scss")]);
        assert_eq!(events, vec![HmrEvent::StyleUpdate { file: "styles.css".into() }]);
        assert_eq!(rx.recv().await.unwrap(), events[0]);
    }

    #[tokio::test]
    async fn source_change_invalidates_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("site")).unwrap();
        fs::write(dir.path().join("site/(index).tsx"), "v1").unwrap();
        let app = dev_app(dir.path());

        let home = Request::new(Method::Get, "/");
        assert_eq!(app.handle(home.clone()).await.headers().get("x-cache"), Some("MISS"));
        assert_eq!(app.handle(home.clone()).await.headers().get("x-cache"), Some("HIT"));
        assert_eq!(
            app.handle(Request::new(Method::Get, "/about")).await.status(),
            StatusCode::NotFound
        );

        let index = app.site_root().join("(index).tsx");
        app.hydration_modules().get_or_build(&index).await.unwrap();
        fs::write(app.site_root().join("(about).tsx"), "").unwrap();

        let events = apply_changes(
            &app,
            [
                index.clone(),
                app.site_root().join("(about).tsx"),
                app.site_root().join(".swap"),
            ],
        );
        assert_eq!(events, vec![HmrEvent::Reload]);
        assert!(app.hydration_modules().is_empty());
        assert_eq!(app.handle(home).await.headers().get("x-cache"), Some("MISS"));
        assert_eq!(
            app.handle(Request::new(Method::Get, "/about")).await.status(),
            StatusCode::Ok
        );
    }

    #[tokio::test]
    async fn non_canonical_root_matches_absolute_watcher_paths() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("site/components")).unwrap();
        fs::create_dir_all(dir.path().join("detour")).unwrap();
        fs::write(dir.path().join("site/(index).tsx"), "").unwrap();
        fs::write(dir.path().join("site/components/Counter.js"), "v1").unwrap();
        let app = dev_app(&dir.path().join("detour/.."));
        let mut rx = app.subscribe_hmr();

        let counter = || Request::new(Method::Get, "/__hydrate?file=components/Counter.js");
        assert_eq!(app.handle(counter()).await.body_text(), "v1");
        fs::write(dir.path().join("site/components/Counter.js"), "v2").unwrap();

        // What the watcher reports: canonical absolute paths, whose temp
        // directory component may itself look hidden.
        let site = fs::canonicalize(dir.path()).unwrap().join("site");
        let events = apply_changes(
            &app,
            [site.join("components/Counter.js"), site.join("styles.css")],
        );
        assert_eq!(
            events,
            vec![
                HmrEvent::StyleUpdate { file: "styles.css".into() },
                HmrEvent::Reload,
            ]
        );
        assert_eq!(rx.recv().await.unwrap(), events[0]);
        assert!(app.hydration_modules().is_empty());
        assert_eq!(app.handle(counter()).await.body_text(), "v2");
    }

    #[tokio::test]
    async fn changes_outside_the_site_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("site")).unwrap();
        fs::write(dir.path().join("site/(index).tsx"), "").unwrap();
        let app = dev_app(dir.path());

        assert!(apply_changes(&app, [dir.path().join("notes.css")]).is_empty());
    }
}

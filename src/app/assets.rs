//! Static files from the site and export directories.
//!
//! ```text
//! GET /styles.css
//!     → percent-decode, reject `..` and hidden components
//!     → site_root/styles.css   (route sources excluded)
//!     → dist_root/styles.css
//!     → none → fall through to page routing
//! ```
//!
//! Only paths whose last segment has an extension are looked up, so page URLs
//! never touch the filesystem.

use std::path::{Component, Path, PathBuf};

use percent_encoding::percent_decode_str;
use tracing::debug;

use crate::http::{Response, StatusCode};

/// Serves files under a fixed set of roots, first match wins.
#[derive(Debug, Clone)]
pub struct StaticFiles {
    site_root: PathBuf,
    dist_root: PathBuf,
    source_extensions: Vec<String>,
}

impl StaticFiles {
    /// `source_extensions` are route file extensions (with the leading dot).
    /// Files with those extensions are never served from the site root.
    pub fn new(site_root: PathBuf, dist_root: PathBuf, source_extensions: Vec<String>) -> Self {
        Self {
            site_root,
            dist_root,
            source_extensions,
        }
    }

    /// Reads the file for a request path, if one exists.
    pub async fn serve(&self, request_path: &str) -> Option<Response> {
        let rel = sanitize_path(request_path)?;
        rel.extension()?;

        if !self.is_source(&rel) {
            if let Some(response) = read(&self.site_root.join(&rel)).await {
                return Some(response);
            }
        }
        read(&self.dist_root.join(&rel)).await
    }

    fn is_source(&self, rel: &Path) -> bool {
        let name = rel.to_string_lossy();
        self.source_extensions.iter().any(|ext| name.ends_with(ext.as_str()))
    }
}

/// Turns a URL path into a relative file path, or `None` when it could
/// escape the root or names a hidden file.
pub fn sanitize_path(request_path: &str) -> Option<PathBuf> {
    let decoded = percent_decode_str(request_path.trim_start_matches('/'))
        .decode_utf8()
        .ok()?;
    let rel = Path::new(decoded.as_ref());
    let mut out = PathBuf::new();
    for component in rel.components() {
        match component {
            Component::Normal(name) if !name.to_string_lossy().starts_with('.') => {
                out.push(name);
            }
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!out.as_os_str().is_empty()).then_some(out)
}

/// `Content-Type` for a file, by extension.
pub fn content_type(path: &Path) -> String {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    if mime.type_().as_str() == "text" {
        format!("{mime}; charset=utf-8")
    } else {
        mime.to_string()
    }
}

async fn read(path: &Path) -> Option<Response> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    if !meta.is_file() {
        return None;
    }
    let body = match tokio::fs::read(path).await {
        Ok(body) => body,
        Err(e) => {
            debug!(file = %path.display(), error = %e, "static file unreadable");
            return None;
        }
    };
    debug!(file = %path.display(), bytes = body.len(), "static file served");
    let mut response = Response::new(StatusCode::Ok);
    response.set_header("Content-Type", content_type(path));
    response.set_body(body);
    Some(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn files(dir: &Path) -> StaticFiles {
        StaticFiles::new(
            dir.join("site"),
            dir.join("dist"),
            vec![".tsx".into(), ".js".into()],
        )
    }

    // ── Path handling ──

    #[test]
    fn traversal_and_hidden_paths_are_rejected() {
        assert_eq!(sanitize_path("/assets/logo.png"), Some(PathBuf::from("assets/logo.png")));
        assert_eq!(sanitize_path("/a%20b.css"), Some(PathBuf::from("a b.css")));
        assert!(sanitize_path("/../../etc/passwd").is_none());
        assert!(sanitize_path("/assets/%2e%2e/%2e%2e/secret").is_none());
        assert!(sanitize_path("/.env").is_none());
        assert!(sanitize_path("/").is_none());
    }

    #[test]
    fn content_type_by_extension() {
        assert_eq!(content_type(Path::new("styles.css")), "text/css; charset=utf-8");
        assert_eq!(content_type(Path::new("logo.png")), "image/png");
        assert_eq!(content_type(Path::new("icon.svg")), "image/svg+xml");
        assert_eq!(content_type(Path::new("blob.unknownext")), "application/octet-stream");
    }

    // ── Lookup ──

    #[tokio::test]
    async fn site_wins_over_dist_and_sources_are_hidden() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("site")).unwrap();
        fs::create_dir_all(dir.path().join("dist/assets")).unwrap();
        fs::write(dir.path().join("site/styles.css"), "body{}").unwrap();
        fs::write(dir.path().join("dist/styles.css"), "stale").unwrap();
        fs::write(dir.path().join("site/(index).tsx"), "source").unwrap();
        fs::write(dir.path().join("dist/assets/app.js"), "bundle").unwrap();
        let files = files(dir.path());

        let css = files.serve("/styles.css").await.unwrap();
        assert_eq!(css.body_text(), "body{}");
        assert_eq!(css.headers().get("content-type"), Some("text/css; charset=utf-8"));

        assert!(files.serve("/(index).tsx").await.is_none());
        assert_eq!(files.serve("/assets/app.js").await.unwrap().body_text(), "bundle");
        assert!(files.serve("/assets").await.is_none());
        assert!(files.serve("/missing.css").await.is_none());
    }
}

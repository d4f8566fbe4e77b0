//! Static export.
//!
//! Prerenders every parameterless SSG/ISR route and writes it to
//! `{dist}/{url}/index.html`, then copies the site's `assets/` directory and
//! `styles.css` alongside. The dist directory is recreated from scratch.

use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use super::{App, AppError};

/// What an export wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportReport {
    /// Written documents, in route table order.
    pub pages: Vec<PathBuf>,
    /// Number of static files copied.
    pub assets: usize,
}

/// Output file for a static URL path.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use islet::app::export::output_path;
///
/// let dist = Path::new("dist");
/// assert_eq!(output_path(dist, "/"), dist.join("index.html"));
/// assert_eq!(output_path(dist, "/blog/archive"), dist.join("blog/archive/index.html"));
/// ```
pub fn output_path(dist: &Path, url_path: &str) -> PathBuf {
    let rel = url_path.trim_matches('/');
    if rel.is_empty() {
        dist.join("index.html")
    } else {
        dist.join(rel).join("index.html")
    }
}

/// Exports `app` into its configured dist directory.
///
/// # Errors
///
/// [`AppError::Render`] when a page fails to prerender and
/// [`AppError::Write`] for filesystem failures.
pub async fn export(app: &App) -> Result<ExportReport, AppError> {
    let dist = app.root().join(&app.config().dist_dir);
    match tokio::fs::remove_dir_all(&dist).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(source) => return Err(AppError::Write { path: dist, source }),
    }
    create_dir(&dist).await?;

    let mut report = ExportReport::default();
    for (url, html) in app.prerender().await? {
        let out = output_path(&dist, &url);
        if let Some(parent) = out.parent() {
            create_dir(parent).await?;
        }
        write(&out, html.as_bytes()).await?;
        debug!(url = %url, file = %out.display(), "exported");
        report.pages.push(out);
    }

    let site = app.site_root();
    report.assets += copy_tree(&site.join("assets"), &dist.join("assets")).await?;
    let styles = site.join("styles.css");
    if styles.is_file() {
        copy(&styles, &dist.join("styles.css")).await?;
        report.assets += 1;
    }

    info!(
        pages = report.pages.len(),
        assets = report.assets,
        dist = %dist.display(),
        "export complete"
    );
    Ok(report)
}

async fn copy_tree(from: &Path, to: &Path) -> Result<usize, AppError> {
    if !from.is_dir() {
        return Ok(0);
    }
    let mut copied = 0;
    for entry in WalkDir::new(from).sort_by_file_name() {
        let entry = entry.map_err(|e| AppError::Write {
            path: from.to_path_buf(),
            source: e.into(),
        })?;
        let rel = entry.path().strip_prefix(from).unwrap_or(entry.path());
        let target = to.join(rel);
        if entry.file_type().is_dir() {
            create_dir(&target).await?;
        } else {
            copy(entry.path(), &target).await?;
            copied += 1;
        }
    }
    Ok(copied)
}

async fn create_dir(path: &Path) -> Result<(), AppError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| AppError::Write {
            path: path.to_path_buf(),
            source,
        })
}

async fn write(path: &Path, contents: &[u8]) -> Result<(), AppError> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|source| AppError::Write {
            path: path.to_path_buf(),
            source,
        })
}

async fn copy(from: &Path, to: &Path) -> Result<(), AppError> {
    tokio::fs::copy(from, to)
        .await
        .map(|_| ())
        .map_err(|source| AppError::Write {
            path: to.to_path_buf(),
            source,
        })
}

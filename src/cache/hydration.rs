//! Transpiled client modules served from `/__hydrate?file=`.
//!
//! Turning a route or island source file into browser JavaScript is delegated
//! to a [`Transpiler`]. Results are cached by path until the dev watcher
//! invalidates them.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

use crate::BoxFuture;

/// Failure to produce a client module.
#[derive(Debug, Error)]
pub enum TranspileError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("`{0}` is not a file under the site directory")]
    OutsideSite(String),

    #[error("failed to transpile {path}: {message}")]
    Failed { path: PathBuf, message: String },
}

/// Produces browser JavaScript for a source file.
pub trait Transpiler: Send + Sync {
    fn transpile<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<String, TranspileError>>;
}

/// Serves files unchanged. Suitable for sources that are already JavaScript.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl Transpiler for Passthrough {
    fn transpile<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<String, TranspileError>> {
        Box::pin(async move {
            tokio::fs::read_to_string(path)
                .await
                .map_err(|source| TranspileError::Io {
                    path: path.to_path_buf(),
                    source,
                })
        })
    }
}

/// Resolves a client-supplied `file` value against the site root.
///
/// The value is treated as site-relative (a leading `/` is ignored). Parent
/// directory components are rejected, so the result never leaves `site_root`.
///
/// # Errors
///
/// [`TranspileError::OutsideSite`] for empty values and `..` components.
pub fn resolve_site_file(site_root: &Path, file: &str) -> Result<PathBuf, TranspileError> {
    let rel = Path::new(file.trim_start_matches('/'));
    let safe = !rel.as_os_str().is_empty()
        && rel.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !safe {
        return Err(TranspileError::OutsideSite(file.to_owned()));
    }
    Ok(site_root.join(rel))
}

/// Transpiled modules keyed by source path.
pub struct HydrationModuleCache {
    transpiler: Arc<dyn Transpiler>,
    modules: DashMap<PathBuf, Arc<str>>,
}

impl HydrationModuleCache {
    pub fn new(transpiler: Arc<dyn Transpiler>) -> Self {
        Self {
            transpiler,
            modules: DashMap::new(),
        }
    }

    /// Returns the cached module for `path`, transpiling it on first use.
    ///
    /// # Errors
    ///
    /// Whatever the [`Transpiler`] reports. Failures are not cached.
    pub async fn get_or_build(&self, path: &Path) -> Result<Arc<str>, TranspileError> {
        if let Some(hit) = self.modules.get(path) {
            return Ok(Arc::clone(hit.value()));
        }
        let code: Arc<str> = self.transpiler.transpile(path).await?.into();
        debug!(path = %path.display(), bytes = code.len(), "hydration module built");
        self.modules.insert(path.to_path_buf(), Arc::clone(&code));
        Ok(code)
    }

    /// Drops the cached module for `path`. Returns whether one was cached.
    pub fn invalidate(&self, path: &Path) -> bool {
        self.modules.remove(path).is_some()
    }

    pub fn clear(&self) {
        self.modules.clear();
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl Default for HydrationModuleCache {
    fn default() -> Self {
        Self::new(Arc::new(Passthrough))
    }
}

//! Filesystem route discovery.
//!
//! Walks the site directory (sorted by file name, so discovery order is stable),
//! keeps files whose extension is allowed and whose name matches the configured
//! route file pattern, and turns each into a [`RouteEntry`].
//!
//! Naming rules for the token captured from the file name:
//!
//! | Token                     | Meaning                                  |
//! |---------------------------|------------------------------------------|
//! | `(index)`, `(home)`       | index of the containing directory        |
//! | `(about)`                 | literal segment `about`                  |
//! | `[id]`, `($id)`           | single-segment parameter `id`            |
//! | `[...rest]`, `(...rest)`  | catch-all parameter `rest`, last only    |
//!
//! Directory names follow the same bracket rules; a plain name or `(name)` is a
//! literal segment. Anything that looks like a route file but does not parse is a
//! [`ScanError`]: the scan never returns a partial table.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::{RouteEntry, RouteKind, RouteTable, Segment};
use crate::config::{ConfigError, FrameworkConfig};

/// Fatal problems found while building the route table.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("site directory {path} does not exist")]
    MissingSiteDir { path: PathBuf },

    #[error("failed to walk {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("malformed route segment `{segment}` in {path}: {reason}")]
    MalformedSegment {
        path: PathBuf,
        segment: String,
        reason: &'static str,
    },

    #[error("parameter `{name}` appears twice in {path}")]
    DuplicateParam { path: PathBuf, name: String },

    #[error("{path} and {existing} both resolve to {url}")]
    DuplicateRoute {
        path: PathBuf,
        existing: PathBuf,
        url: String,
    },

    #[error("failed to compile pattern for {path}: {source}")]
    Pattern {
        path: PathBuf,
        #[source]
        source: regex::Error,
    },
}

// What a route file's own token contributes.
#[derive(Debug, PartialEq, Eq)]
enum FileSegment {
    Index,
    Segment(Segment),
}

struct Discovered {
    rel_path: String,
    file_path: PathBuf,
    dir_rel: String,
    segments: Vec<Segment>,
    is_index: bool,
}

/// Scans `site_root` into a priority-ordered [`RouteTable`].
///
/// Every entry starts with the configured default render mode; modules may
/// override it later through [`RouteTable::apply_modes`].
///
/// # Errors
///
/// Any [`ScanError`]; each variant names the offending path.
pub fn scan_routes(site_root: &Path, config: &FrameworkConfig) -> Result<RouteTable, ScanError> {
    let file_pattern = config.routes.compiled_pattern()?;
    if !site_root.is_dir() {
        return Err(ScanError::MissingSiteDir {
            path: site_root.to_path_buf(),
        });
    }

    let api_dir = site_root.join(&config.api.dir);
    let mut discovered: Vec<Discovered> = Vec::new();

    let walker = WalkDir::new(site_root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !(is_ignored(e.file_name()) || e.path() == api_dir));

    for entry in walker {
        let entry = entry.map_err(|source| ScanError::Walk {
            path: source
                .path()
                .map_or_else(|| site_root.to_path_buf(), Path::to_path_buf),
            source,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if !config
            .routes
            .file_extensions
            .iter()
            .any(|ext| name.ends_with(ext.as_str()))
        {
            continue;
        }
        let Some(caps) = file_pattern.captures(name) else {
            continue;
        };

        let path = entry.path();
        let token = caps.get(1).map_or(name, |m| m.as_str());
        let rel = path.strip_prefix(site_root).unwrap_or(path);
        let rel_path = to_slash_path(rel);
        let dir_rel = rel
            .parent()
            .map(to_slash_path)
            .unwrap_or_default();

        let mut segments = dir_segments(&dir_rel, path)?;
        let is_index = match parse_file_token(token, path)? {
            FileSegment::Index => true,
            FileSegment::Segment(seg) => {
                segments.push(seg);
                false
            }
        };
        validate_segments(&segments, path)?;

        discovered.push(Discovered {
            rel_path,
            file_path: path.to_path_buf(),
            dir_rel,
            segments,
            is_index,
        });
    }

    let mut seen: HashMap<String, PathBuf> = HashMap::new();
    let mut entries = Vec::with_capacity(discovered.len());

    for (order, route) in discovered.iter().enumerate() {
        let entry = RouteEntry::new(
            route.rel_path.clone(),
            route.file_path.clone(),
            &route.segments,
            RouteKind::Page,
            order,
        )
        .map_err(|source| ScanError::Pattern {
            path: route.file_path.clone(),
            source,
        })?
        .with_mode(
            config.rendering.default_mode,
            config.rendering.default_revalidate_seconds,
        );

        if let Some(existing) = seen.get(entry.url_pattern()) {
            return Err(ScanError::DuplicateRoute {
                path: route.file_path.clone(),
                existing: existing.clone(),
                url: entry.url_path().to_owned(),
            });
        }
        seen.insert(entry.url_pattern().to_owned(), route.file_path.clone());
        entries.push(entry);
    }

    if config.routes.enable_index_fallback {
        let fallbacks = index_fallbacks(&discovered, &seen, site_root, discovered.len())?;
        entries.extend(fallbacks.into_iter().map(|e| {
            e.with_mode(
                config.rendering.default_mode,
                config.rendering.default_revalidate_seconds,
            )
        }));
    }

    let table = RouteTable::new(entries);
    info!(routes = table.len(), site = %site_root.display(), "routes discovered");
    for route in table.iter() {
        debug!(
            url = %route.url_path(),
            file = %route.rel_path(),
            mode = %route.render_mode(),
            kind = ?route.kind(),
            "route"
        );
    }
    Ok(table)
}

// Directories that hold route files somewhere below them but have no index of
// their own borrow the nearest ancestor index.
fn index_fallbacks(
    discovered: &[Discovered],
    taken: &HashMap<String, PathBuf>,
    site_root: &Path,
    first_order: usize,
) -> Result<Vec<RouteEntry>, ScanError> {
    let indexes: HashMap<&str, &Discovered> = discovered
        .iter()
        .filter(|d| d.is_index)
        .map(|d| (d.dir_rel.as_str(), d))
        .collect();

    let mut route_dirs: BTreeSet<&str> = BTreeSet::new();
    for route in discovered {
        let mut dir = route.dir_rel.as_str();
        while !dir.is_empty() {
            route_dirs.insert(dir);
            dir = parent_dir(dir);
        }
    }

    let mut taken: HashSet<String> = taken.keys().cloned().collect();
    let mut out = Vec::new();
    for dir in route_dirs {
        if indexes.contains_key(dir) {
            continue;
        }
        let mut ancestor = parent_dir(dir);
        let index = loop {
            if let Some(found) = indexes.get(ancestor) {
                break Some(*found);
            }
            if ancestor.is_empty() {
                break None;
            }
            ancestor = parent_dir(ancestor);
        };
        let Some(index) = index else {
            continue;
        };

        let dir_path = site_root.join(dir);
        let segments = dir_segments(dir, &dir_path)?;
        let entry = RouteEntry::new(
            index.rel_path.clone(),
            index.file_path.clone(),
            &segments,
            RouteKind::IndexFallback,
            first_order + out.len(),
        )
        .map_err(|source| ScanError::Pattern {
            path: dir_path.clone(),
            source,
        })?;

        if taken.insert(entry.url_pattern().to_owned()) {
            debug!(dir, index = %index.rel_path, "index fallback");
            out.push(entry);
        }
    }
    Ok(out)
}

fn parent_dir(dir: &str) -> &str {
    dir.rsplit_once('/').map_or("", |(parent, _)| parent)
}

fn is_ignored(name: &std::ffi::OsStr) -> bool {
    name.to_str()
        .is_none_or(|n| n.starts_with('.') || n == "node_modules")
}

fn to_slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn dir_segments(dir_rel: &str, path: &Path) -> Result<Vec<Segment>, ScanError> {
    dir_rel
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|name| parse_dir_segment(name, path))
        .collect()
}

fn malformed(path: &Path, segment: &str, reason: &'static str) -> ScanError {
    ScanError::MalformedSegment {
        path: path.to_path_buf(),
        segment: segment.to_owned(),
        reason,
    }
}

fn has_delimiters(s: &str) -> bool {
    s.contains(['(', ')', '[', ']'])
}

fn parse_dir_segment(name: &str, path: &Path) -> Result<Segment, ScanError> {
    if let Some(inner) = name.strip_prefix('[') {
        let inner = inner
            .strip_suffix(']')
            .ok_or_else(|| malformed(path, name, "unclosed `[`"))?;
        return bracket_param(inner, name, path);
    }
    if let Some(inner) = name.strip_prefix('(') {
        let inner = inner
            .strip_suffix(')')
            .ok_or_else(|| malformed(path, name, "unclosed `(`"))?;
        return literal(inner, name, path);
    }
    literal(name, name, path)
}

fn parse_file_token(token: &str, path: &Path) -> Result<FileSegment, ScanError> {
    if let Some(inner) = token.strip_prefix('[') {
        let inner = inner
            .strip_suffix(']')
            .ok_or_else(|| malformed(path, token, "unclosed `[`"))?;
        return bracket_param(inner, token, path).map(FileSegment::Segment);
    }
    if let Some(inner) = token.strip_prefix('(') {
        let inner = inner
            .strip_suffix(')')
            .ok_or_else(|| malformed(path, token, "unclosed `(`"))?;
        if inner == "index" || inner == "home" {
            return Ok(FileSegment::Index);
        }
        if let Some(name) = inner.strip_prefix("...") {
            return param_name(name, token, path)
                .map(|n| FileSegment::Segment(Segment::CatchAll(n)));
        }
        if let Some(name) = inner.strip_prefix('$') {
            return param_name(name, token, path).map(|n| FileSegment::Segment(Segment::Param(n)));
        }
        return literal(inner, token, path).map(FileSegment::Segment);
    }
    literal(token, token, path).map(FileSegment::Segment)
}

fn bracket_param(inner: &str, segment: &str, path: &Path) -> Result<Segment, ScanError> {
    match inner.strip_prefix("...") {
        Some(name) => param_name(name, segment, path).map(Segment::CatchAll),
        None => param_name(inner, segment, path).map(Segment::Param),
    }
}

fn param_name(name: &str, segment: &str, path: &Path) -> Result<String, ScanError> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(malformed(path, segment, "empty parameter name"));
    };
    let valid = (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(malformed(path, segment, "parameter names must be identifiers"));
    }
    Ok(name.to_owned())
}

fn literal(name: &str, segment: &str, path: &Path) -> Result<Segment, ScanError> {
    if name.is_empty() {
        return Err(malformed(path, segment, "empty segment name"));
    }
    if has_delimiters(name) {
        return Err(malformed(path, segment, "unbalanced brackets"));
    }
    Ok(Segment::Literal(name.to_owned()))
}

fn validate_segments(segments: &[Segment], path: &Path) -> Result<(), ScanError> {
    if let Some(pos) = segments
        .iter()
        .position(|s| matches!(s, Segment::CatchAll(_)))
    {
        if pos + 1 != segments.len() {
            let segment = match &segments[pos] {
                Segment::CatchAll(name) => format!("[...{name}]"),
                _ => String::new(),
            };
            return Err(malformed(path, &segment, "catch-all must be the last segment"));
        }
    }

    let mut names = HashSet::new();
    for name in segments.iter().filter_map(Segment::param_name) {
        if !names.insert(name) {
            return Err(ScanError::DuplicateParam {
                path: path.to_path_buf(),
                name: name.to_owned(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderMode;
    use std::fs;

    fn site(files: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for file in files {
            let path = dir.path().join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, "export default () => null").unwrap();
        }
        dir
    }

    fn urls(table: &RouteTable) -> Vec<String> {
        table.iter().map(|e| e.url_path().to_owned()).collect()
    }

    #[test]
    fn scans_nested_routes_in_priority_order() {
        let dir = site(&[
            "(index).tsx",
            "(about).tsx",
            "blog/[slug].tsx",
            "blog/(archive).tsx",
            "blog/(index).tsx",
            "docs/[...rest].tsx",
            "[lang]/(about).tsx",
        ]);
        let table = scan_routes(dir.path(), &FrameworkConfig::default()).unwrap();
        assert_eq!(
            urls(&table),
            vec![
                "/blog/archive",
                "/about",
                "/blog",
                "/:lang/about",
                "/blog/:slug",
                "/docs/*rest",
                "/",
                "/docs",
                "/:lang",
            ]
        );
    }

    #[test]
    fn ordering_independent_of_file_names() {
        // `($slug)` is discovered before `(zzz)`.
        let dir = site(&["blog/($slug).tsx", "blog/(zzz).tsx"]);
        let table = scan_routes(dir.path(), &FrameworkConfig::default()).unwrap();
        let m = table.match_path("/blog/zzz").unwrap();
        assert_eq!(m.route.rel_path(), "blog/(zzz).tsx");
    }

    #[test]
    fn dollar_and_route_group_directories() {
        let dir = site(&["(blog)/($slug).tsx", "(home).tsx"]);
        let table = scan_routes(dir.path(), &FrameworkConfig::default()).unwrap();
        let m = table.match_path("/blog/hello-world").unwrap();
        assert_eq!(m.params.get("slug"), Some("hello-world"));
        assert_eq!(table.match_path("/").unwrap().route.rel_path(), "(home).tsx");
    }

    #[test]
    fn non_route_files_and_api_dir_skipped() {
        let dir = site(&[
            "(index).tsx",
            "components/Counter.tsx",
            "styles/global.scss",
            "api/(hello).ts",
            ".cache/(ghost).tsx",
            "(notes).md",
        ]);
        let table = scan_routes(dir.path(), &FrameworkConfig::default()).unwrap();
        assert_eq!(urls(&table), vec!["/"]);
    }

    #[test]
    fn entries_take_configured_defaults() {
        let dir = site(&["(index).tsx"]);
        let mut config = FrameworkConfig::default();
        config.rendering.default_mode = RenderMode::Isr;
        config.rendering.default_revalidate_seconds = 10;
        let table = scan_routes(dir.path(), &config).unwrap();
        let entry = table.iter().next().unwrap();
        assert_eq!(entry.render_mode(), RenderMode::Isr);
        assert_eq!(entry.revalidate_seconds(), 10);
        assert!(entry.file_path().is_absolute());
    }

    #[test]
    fn malformed_segments_are_fatal_and_name_the_file() {
        for bad in ["[oops.tsx", "(a[b]).tsx", "[].tsx", "[1abc].tsx", "[...].tsx", "().tsx"] {
            let dir = site(&[bad]);
            let err = scan_routes(dir.path(), &FrameworkConfig::default()).unwrap_err();
            assert!(
                matches!(err, ScanError::MalformedSegment { .. }),
                "{bad}: {err}"
            );
            assert!(err.to_string().contains(dir.path().to_str().unwrap()), "{err}");
        }
    }

    #[test]
    fn malformed_directory_is_fatal() {
        let dir = site(&["[id/(index).tsx"]);
        let err = scan_routes(dir.path(), &FrameworkConfig::default()).unwrap_err();
        assert!(matches!(err, ScanError::MalformedSegment { .. }));
    }

    #[test]
    fn catch_all_must_be_last() {
        let dir = site(&["[...all]/(edit).tsx"]);
        let err = scan_routes(dir.path(), &FrameworkConfig::default()).unwrap_err();
        assert!(err.to_string().contains("catch-all"));
    }

    #[test]
    fn duplicate_params_rejected() {
        let dir = site(&["[id]/[id].tsx"]);
        let err = scan_routes(dir.path(), &FrameworkConfig::default()).unwrap_err();
        assert!(matches!(err, ScanError::DuplicateParam { ref name, .. } if name == "id"));
    }

    #[test]
    fn duplicate_urls_rejected() {
        let dir = site(&["(home).tsx", "(index).tsx"]);
        let err = scan_routes(dir.path(), &FrameworkConfig::default()).unwrap_err();
        assert!(matches!(err, ScanError::DuplicateRoute { .. }));
    }

    #[test]
    fn missing_site_dir() {
        let dir = tempfile::tempdir().unwrap();
        let err = scan_routes(&dir.path().join("nope"), &FrameworkConfig::default()).unwrap_err();
        assert!(matches!(err, ScanError::MissingSiteDir { .. }));
    }

    #[test]
    fn index_fallback_uses_nearest_ancestor() {
        let dir = site(&[
            "(index).tsx",
            "shop/(index).tsx",
            "shop/items/[id].tsx",
            "blog/[slug].tsx",
        ]);
        let table = scan_routes(dir.path(), &FrameworkConfig::default()).unwrap();

        let shop_items = table.match_path("/shop/items").unwrap();
        assert_eq!(shop_items.route.kind(), RouteKind::IndexFallback);
        assert_eq!(shop_items.route.rel_path(), "shop/(index).tsx");

        let blog = table.match_path("/blog/").unwrap();
        assert_eq!(blog.route.rel_path(), "(index).tsx");
        assert_eq!(blog.route.id(), "(index).tsx@_blog");
        assert_ne!(blog.route.id(), table.match_path("/").unwrap().route.id());
        assert_eq!(table.iter().last().unwrap().kind(), RouteKind::IndexFallback);
    }

    #[test]
    fn fallback_never_shadows_a_real_route() {
        let dir = site(&["(index).tsx", "(blog).tsx", "blog/[slug].tsx"]);
        let table = scan_routes(dir.path(), &FrameworkConfig::default()).unwrap();
        assert_eq!(table.match_path("/blog").unwrap().route.rel_path(), "(blog).tsx");
        assert!(table.iter().all(|e| e.kind() == RouteKind::Page));
    }

    #[test]
    fn fallback_disabled() {
        let dir = site(&["(index).tsx", "blog/[slug].tsx"]);
        let mut config = FrameworkConfig::default();
        config.routes.enable_index_fallback = false;
        let table = scan_routes(dir.path(), &config).unwrap();
        assert!(table.match_path("/blog").is_none());
    }

    #[test]
    fn custom_pattern_and_extensions() {
        let dir = site(&["(index).page.rs", "(about).tsx"]);
        let mut config = FrameworkConfig::default();
        config.routes.file_extensions = vec![".page.rs".into()];
        config.routes.route_file_pattern = r"^(\(.+\))\.page\.rs$".into();
        let table = scan_routes(dir.path(), &config).unwrap();
        assert_eq!(urls(&table), vec!["/"]);
    }
}

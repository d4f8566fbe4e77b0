//! Route table and request matching.
//!
//! The table is produced once by [`scan::scan_routes`] from the site directory and
//! then only read. Each [`RouteEntry`] carries an anchored regular expression with one
//! capture group per dynamic segment:
//!
//! | Route file                   | URL path           | Pattern                    | Params   |
//! |------------------------------|--------------------|----------------------------|----------|
//! | `(index).tsx`                | `/`                | `^/$`                      | *(none)* |
//! | `blog/(archive).tsx`         | `/blog/archive`    | `^/blog/archive$`          | *(none)* |
//! | `blog/[slug].tsx`            | `/blog/:slug`      | `^/blog/([^/]+)$`          | `slug`   |
//! | `docs/[...rest].tsx`         | `/docs/*rest`      | `^/docs/(.+)$`             | `rest`   |
//!
//! One trailing slash is stripped from incoming paths before matching, so `/blog/`
//! and `/blog` are equivalent while `/blog//` matches neither. Entries are tried
//! in table order, which the scanner has already sorted from most to least
//! specific; the first hit wins.

pub mod scan;

use std::cmp::Reverse;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::config::RenderMode;
use crate::context::Params;
use crate::http::request::decode_component;

pub use scan::{ScanError, scan_routes};

/// One segment of a route's URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Matches itself exactly.
    Literal(String),
    /// Matches one non-empty path segment and binds it.
    Param(String),
    /// Matches one or more path segments, slashes included, and binds them.
    CatchAll(String),
}

impl Segment {
    fn regex_source(&self) -> String {
        match self {
            Self::Literal(s) => regex::escape(s),
            Self::Param(_) => "([^/]+)".to_owned(),
            Self::CatchAll(_) => "(.+)".to_owned(),
        }
    }

    fn display(&self) -> String {
        match self {
            Self::Literal(s) => s.clone(),
            Self::Param(name) => format!(":{name}"),
            Self::CatchAll(name) => format!("*{name}"),
        }
    }

    fn param_name(&self) -> Option<&str> {
        match self {
            Self::Literal(_) => None,
            Self::Param(name) | Self::CatchAll(name) => Some(name),
        }
    }
}

/// Whether an entry comes from its own route file or stands in for a missing index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    Page,
    /// A directory without an index route, served by its nearest ancestor's index.
    IndexFallback,
}

/// One discovered route.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    id: String,
    file_path: PathBuf,
    rel_path: String,
    url_path: String,
    url_pattern: String,
    regex: Regex,
    param_names: Vec<String>,
    render_mode: RenderMode,
    revalidate_seconds: u64,
    kind: RouteKind,
    literal_segments: usize,
    total_segments: usize,
    has_catch_all: bool,
    order: usize,
}

impl RouteEntry {
    /// Compiles an entry from its URL segments.
    ///
    /// `rel_path` is the site-relative route file (forward slashes); it doubles as
    /// the key under which the route's module is registered.
    pub fn new(
        rel_path: impl Into<String>,
        file_path: impl Into<PathBuf>,
        segments: &[Segment],
        kind: RouteKind,
        order: usize,
    ) -> Result<Self, regex::Error> {
        let rel_path = rel_path.into();
        let url_pattern = if segments.is_empty() {
            "^/$".to_owned()
        } else {
            let body: Vec<String> = segments.iter().map(Segment::regex_source).collect();
            format!("^/{}$", body.join("/"))
        };
        let url_path = format!(
            "/{}",
            segments
                .iter()
                .map(Segment::display)
                .collect::<Vec<_>>()
                .join("/")
        );
        let regex = Regex::new(&url_pattern)?;
        let param_names = segments
            .iter()
            .filter_map(Segment::param_name)
            .map(str::to_owned)
            .collect();

        // A fallback shares its file with the ancestor index, so the URL keeps
        // the two apart.
        let id = match kind {
            RouteKind::IndexFallback => format!("{rel_path}@{url_path}"),
            RouteKind::Page => rel_path.clone(),
        }
        .replace('/', "_");

        Ok(Self {
            id,
            file_path: file_path.into(),
            rel_path,
            url_path,
            url_pattern,
            regex,
            param_names,
            render_mode: RenderMode::default(),
            revalidate_seconds: 0,
            kind,
            literal_segments: segments
                .iter()
                .filter(|s| matches!(s, Segment::Literal(_)))
                .count(),
            total_segments: segments.len(),
            has_catch_all: segments.iter().any(|s| matches!(s, Segment::CatchAll(_))),
            order,
        })
    }

    /// Sets the render mode and ISR window.
    #[must_use]
    pub fn with_mode(mut self, mode: RenderMode, revalidate_seconds: u64) -> Self {
        self.render_mode = mode;
        self.revalidate_seconds = revalidate_seconds;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn rel_path(&self) -> &str {
        &self.rel_path
    }

    /// Human-readable pattern, e.g. `/blog/:slug`.
    pub fn url_path(&self) -> &str {
        &self.url_path
    }

    /// Regular-expression source the entry matches with.
    pub fn url_pattern(&self) -> &str {
        &self.url_pattern
    }

    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    pub fn render_mode(&self) -> RenderMode {
        self.render_mode
    }

    pub fn revalidate_seconds(&self) -> u64 {
        self.revalidate_seconds
    }

    pub fn kind(&self) -> RouteKind {
        self.kind
    }

    /// Number of capture groups in the compiled pattern.
    pub fn capture_count(&self) -> usize {
        self.regex.captures_len() - 1
    }

    /// `true` when the pattern binds no parameters, so exactly one URL maps to it.
    pub fn is_static(&self) -> bool {
        self.param_names.is_empty()
    }

    fn sort_key(&self) -> (bool, Reverse<usize>, usize, bool, usize) {
        (
            self.kind == RouteKind::IndexFallback,
            Reverse(self.literal_segments),
            self.total_segments,
            self.has_catch_all,
            self.order,
        )
    }

    // Anchored match against an already-normalized path.
    fn captures(&self, path: &str) -> Option<Params> {
        let caps = self.regex.captures(path)?;
        let mut params = Params::new();
        for (i, name) in self.param_names.iter().enumerate() {
            let raw = caps.get(i + 1).map_or("", |m| m.as_str());
            params.insert(name.clone(), decode_component(raw));
        }
        Some(params)
    }
}

/// Outcome of a successful match. Borrowed from the table for one request.
#[derive(Debug, Clone)]
pub struct MatchResult<'a> {
    pub route: &'a RouteEntry,
    pub params: Params,
}

/// Priority-ordered, read-only route table.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
}

impl RouteTable {
    /// Builds a table, sorting entries by specificity.
    ///
    /// More literal segments come first, then fewer total segments, then entries
    /// without a catch-all, then discovery order. Index fallbacks are always last.
    pub fn new(mut entries: Vec<RouteEntry>) -> Self {
        entries.sort_by_key(RouteEntry::sort_key);
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RouteEntry> {
        self.entries.iter()
    }

    /// Looks up the page entry compiled from `rel_path`.
    pub fn by_rel_path(&self, rel_path: &str) -> Option<&RouteEntry> {
        self.entries
            .iter()
            .find(|e| e.kind == RouteKind::Page && e.rel_path == rel_path)
    }

    /// Rewrites every entry's render mode, e.g. from per-module overrides.
    pub fn apply_modes(&mut self, mut f: impl FnMut(&RouteEntry) -> (RenderMode, u64)) {
        for entry in &mut self.entries {
            let (mode, revalidate) = f(entry);
            entry.render_mode = mode;
            entry.revalidate_seconds = revalidate;
        }
    }

    /// Finds the first entry matching `pathname` and extracts its decoded params.
    ///
    /// `pathname` is the raw (still percent-encoded) request path without query.
    /// Returns `None` when nothing matches; that is an ordinary outcome, not an error.
    ///
    /// # Examples
    ///
    /// ```
    /// use islet::router::{RouteEntry, RouteKind, RouteTable, Segment};
    ///
    /// let slug = RouteEntry::new(
    ///     "blog/[slug].tsx",
    ///     "/site/blog/[slug].tsx",
    ///     &[Segment::Literal("blog".into()), Segment::Param("slug".into())],
    ///     RouteKind::Page,
    ///     0,
    /// )
    /// .unwrap();
    /// let table = RouteTable::new(vec![slug]);
    ///
    /// let m = table.match_path("/blog/hello-world/").unwrap();
    /// assert_eq!(m.params.get("slug"), Some("hello-world"));
    /// assert!(table.match_path("/blog").is_none());
    /// ```
    pub fn match_path(&self, pathname: &str) -> Option<MatchResult<'_>> {
        let path = normalize_path(pathname);
        self.entries.iter().find_map(|route| {
            route
                .captures(path)
                .map(|params| MatchResult { route, params })
        })
    }
}

/// Strips one trailing slash, keeping the root as `/`.
pub fn normalize_path(path: &str) -> &str {
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    if trimmed.is_empty() { "/" } else { trimmed }
}

//! Island hydration markers and the island registry.
//!
//! Every interactive island in a server-rendered page is announced by an HTML
//! comment placed immediately before its wrapper element:
//!
//! ```text
//! <!--__ISLAND_VISIBLE__:counter-0:/site/components/Counter.tsx:{"start":5}-->
//! <div id="counter-0" data-island="Counter">…server markup…</div>
//! ```
//!
//! The client bootstrap (see [`client`]) scans the document for these markers
//! and hydrates each island according to its [`Strategy`]. Ids and component
//! paths are `:`-delimited, so neither may contain `:` or `-->`; props are JSON
//! with `<` and `>` written as `\u003c` / `\u003e`, which keeps the comment and
//! any enclosing script element intact while still being plain JSON.

pub mod client;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::render::view::Node;

/// When the client hydrates an island.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// As soon as the bootstrap runs.
    Load,
    /// When the browser is idle.
    Idle,
    /// When the island scrolls into view.
    Visible,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Idle => "idle",
            Self::Visible => "visible",
        }
    }

    fn marker_tag(self) -> &'static str {
        match self {
            Self::Load => "LOAD",
            Self::Idle => "IDLE",
            Self::Visible => "VISIBLE",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = HydrationParseError;

    /// Accepts both the lowercase name and the uppercase marker tag.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "load" | "LOAD" => Ok(Self::Load),
            "idle" | "IDLE" => Ok(Self::Idle),
            "visible" | "VISIBLE" => Ok(Self::Visible),
            other => Err(HydrationParseError::UnknownStrategy(other.to_owned())),
        }
    }
}

/// One island as announced by its marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Island {
    pub id: String,
    pub component: String,
    pub strategy: Strategy,
    pub props: Value,
}

/// Rejected while encoding a marker.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MarkerError {
    #[error("island {field} `{value}` must not be empty")]
    Empty { field: &'static str, value: String },

    #[error("island {field} `{value}` must not contain `:` or `-->`")]
    Delimiter { field: &'static str, value: String },
}

/// A malformed marker found while scanning a document.
#[derive(Debug, Error)]
pub enum HydrationParseError {
    #[error("unknown hydration strategy `{0}`")]
    UnknownStrategy(String),

    #[error("island marker is missing its {0}")]
    MissingField(&'static str),

    #[error("invalid props for island `{id}`: {source}")]
    Props {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

fn check_field(field: &'static str, value: &str) -> Result<(), MarkerError> {
    if value.is_empty() {
        return Err(MarkerError::Empty {
            field,
            value: value.to_owned(),
        });
    }
    if value.contains(':') || value.contains("-->") {
        return Err(MarkerError::Delimiter {
            field,
            value: value.to_owned(),
        });
    }
    Ok(())
}

/// Encodes the hydration marker comment for `island`.
///
/// # Errors
///
/// [`MarkerError`] when the id or component path is empty or contains a
/// delimiter.
///
/// # Examples
///
/// ```
/// use islet::islands::{Island, Strategy, encode_marker, extract_islands};
/// use serde_json::json;
///
/// let island = Island {
///     id: "counter-0".into(),
///     component: "/site/components/Counter.tsx".into(),
///     strategy: Strategy::Visible,
///     props: json!({"label": "<b>5</b>"}),
/// };
/// let marker = encode_marker(&island).unwrap();
/// assert!(marker.starts_with("<!--__ISLAND_VISIBLE__:counter-0:"));
/// assert!(!marker[4..marker.len() - 3].contains('<'));
///
/// let parsed = extract_islands(&marker);
/// assert_eq!(parsed[0].as_ref().unwrap(), &island);
/// ```
pub fn encode_marker(island: &Island) -> Result<String, MarkerError> {
    check_field("id", &island.id)?;
    check_field("component", &island.component)?;
    let props = serde_json::to_string(&island.props).unwrap_or_else(|_| "null".to_owned());
    let props = escape_json(&props);
    Ok(format!(
        "<!--__ISLAND_{}__:{}:{}:{}-->",
        island.strategy.marker_tag(),
        island.id,
        island.component,
        props
    ))
}

/// Replaces `<` and `>` in serialized JSON with their `\u` escapes.
///
/// Both characters only occur inside JSON strings, where the escaped form
/// decodes to the same value.
pub fn escape_json(json: &str) -> String {
    json.replace('<', "\\u003c").replace('>', "\\u003e")
}

static MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--__ISLAND_([A-Z]*)__:(.*?)-->").expect("island marker regex")
});

/// Scans `html` for island markers, in document order.
///
/// Each marker yields one entry; a malformed marker yields an error entry and
/// the scan carries on with the next one.
pub fn extract_islands(html: &str) -> Vec<Result<Island, HydrationParseError>> {
    MARKER
        .captures_iter(html)
        .map(|caps| {
            let tag = caps.get(1).map_or("", |m| m.as_str());
            let body = caps.get(2).map_or("", |m| m.as_str());
            parse_marker(tag, body)
        })
        .collect()
}

fn parse_marker(tag: &str, body: &str) -> Result<Island, HydrationParseError> {
    let strategy = match tag {
        "LOAD" | "IDLE" | "VISIBLE" => tag.parse()?,
        other => return Err(HydrationParseError::UnknownStrategy(other.to_owned())),
    };
    let mut parts = body.splitn(3, ':');
    let id = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or(HydrationParseError::MissingField("id"))?;
    let component = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or(HydrationParseError::MissingField("component"))?;
    let props = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or(HydrationParseError::MissingField("props"))?;
    let props = serde_json::from_str(props).map_err(|source| HydrationParseError::Props {
        id: id.to_owned(),
        source,
    })?;
    Ok(Island {
        id: id.to_owned(),
        component: component.to_owned(),
        strategy,
        props,
    })
}

/// Like [`extract_islands`], logging and dropping malformed markers.
pub fn discover_islands(html: &str) -> Vec<Island> {
    extract_islands(html)
        .into_iter()
        .filter_map(|result| match result {
            Ok(island) => Some(island),
            Err(e) => {
                warn!(error = %e, "skipping malformed island marker");
                None
            }
        })
        .collect()
}

/// Server-side rendering of an island's initial markup.
pub trait IslandComponent: Send + Sync {
    fn render(&self, props: &Value) -> Node;
}

impl<F> IslandComponent for F
where
    F: Fn(&Value) -> Node + Send + Sync,
{
    fn render(&self, props: &Value) -> Node {
        self(props)
    }
}

/// A registered island.
#[derive(Clone)]
pub struct IslandDef {
    name: String,
    component: String,
    strategy: Strategy,
    server: Arc<dyn IslandComponent>,
}

impl IslandDef {
    /// `component` is the path the client resolves through `/__hydrate?file=`.
    pub fn new(
        name: impl Into<String>,
        component: impl Into<String>,
        strategy: Strategy,
        server: impl IslandComponent + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            component: component.into(),
            strategy,
            server: Arc::new(server),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn render(&self, props: &Value) -> Node {
        self.server.render(props)
    }
}

impl fmt::Debug for IslandDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IslandDef")
            .field("name", &self.name)
            .field("component", &self.component)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

/// Islands known to the renderer, by name.
#[derive(Debug, Clone, Default)]
pub struct IslandRegistry {
    islands: HashMap<String, IslandDef>,
}

impl IslandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `def`, replacing any island with the same name.
    pub fn register(&mut self, def: IslandDef) -> &mut Self {
        if let Some(old) = self.islands.insert(def.name.clone(), def) {
            warn!(island = %old.name, "island registered twice, keeping the later one");
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&IslandDef> {
        self.islands.get(name)
    }

    pub fn len(&self) -> usize {
        self.islands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.islands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn island(props: Value) -> Island {
        Island {
            id: "c-0".into(),
            component: "/components/Counter.tsx".into(),
            strategy: Strategy::Idle,
            props,
        }
    }

    // ── encode_marker ─────────────────────────────────────────────────────────

    #[test]
    fn marker_layout() {
        let marker = encode_marker(&island(json!({"n": 1}))).unwrap();
        assert_eq!(
            marker,
            r#"<!--__ISLAND_IDLE__:c-0:/components/Counter.tsx:{"n":1}-->"#
        );
    }

    #[test]
    fn angle_brackets_escaped_and_restored() {
        let original = island(json!({"html": "<script>alert(1)</script>", "arrow": "-->"}));
        let marker = encode_marker(&original).unwrap();
        assert!(marker.contains(r"\u003cscript\u003e"));
        assert_eq!(marker.matches("-->").count(), 1);

        let parsed = extract_islands(&marker);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].as_ref().unwrap(), &original);
    }

    #[test]
    fn delimiters_rejected() {
        let mut bad = island(Value::Null);
        bad.id = "a:b".into();
        assert!(matches!(encode_marker(&bad), Err(MarkerError::Delimiter { field: "id", .. })));

        let mut bad = island(Value::Null);
        bad.component = "c:/x.tsx".into();
        assert!(matches!(
            encode_marker(&bad),
            Err(MarkerError::Delimiter { field: "component", .. })
        ));

        let mut bad = island(Value::Null);
        bad.id = String::new();
        assert!(matches!(encode_marker(&bad), Err(MarkerError::Empty { .. })));
    }

    // ── extract_islands ───────────────────────────────────────────────────────

    #[test]
    fn props_may_contain_colons() {
        let original = island(json!({"url": "https://example.com:8080/x"}));
        let marker = encode_marker(&original).unwrap();
        assert_eq!(extract_islands(&marker)[0].as_ref().unwrap(), &original);
    }

    #[test]
    fn malformed_markers_do_not_abort_the_scan() {
        let good = encode_marker(&island(json!([1, 2]))).unwrap();
        let html = format!(
            "<!--__ISLAND_LOAD__:x:/a.tsx:{{not json-->\
             <!--__ISLAND_SOON__:y:/b.tsx:{{}}-->\
             <!--__ISLAND_LOAD__:z-->\
             {good}"
        );
        let results = extract_islands(&html);
        assert_eq!(results.len(), 4);
        assert!(matches!(results[0], Err(HydrationParseError::Props { .. })));
        assert!(matches!(results[1], Err(HydrationParseError::UnknownStrategy(_))));
        assert!(matches!(results[2], Err(HydrationParseError::MissingField("component"))));
        assert!(results[3].is_ok());

        let found = discover_islands(&html);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].props, json!([1, 2]));
    }

    #[test]
    fn document_order_preserved() {
        let mut a = island(json!(null));
        a.id = "a".into();
        a.strategy = Strategy::Load;
        let mut b = island(json!(null));
        b.id = "b".into();
        b.strategy = Strategy::Visible;
        let html = format!(
            "<p>x</p>{}<div></div>{}",
            encode_marker(&a).unwrap(),
            encode_marker(&b).unwrap()
        );
        let ids: Vec<_> = discover_islands(&html).into_iter().map(|i| i.id).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn ordinary_comments_ignored() {
        assert!(extract_islands("<!-- hello --><!--__PPR_START__:x-->").is_empty());
    }

    #[test]
    fn strategy_names() {
        assert_eq!("visible".parse::<Strategy>().unwrap(), Strategy::Visible);
        assert_eq!("IDLE".parse::<Strategy>().unwrap(), Strategy::Idle);
        assert!("eager".parse::<Strategy>().is_err());
        assert_eq!(serde_json::to_string(&Strategy::Load).unwrap(), r#""load""#);
    }

    // ── IslandRegistry ────────────────────────────────────────────────────────

    #[test]
    fn registry_renders_server_markup() {
        let mut registry = IslandRegistry::new();
        registry.register(IslandDef::new(
            "Counter",
            "/components/Counter.tsx",
            Strategy::Load,
            |props: &Value| Node::text(props["start"].to_string()),
        ));
        let def = registry.get("Counter").unwrap();
        assert_eq!(def.strategy(), Strategy::Load);
        assert_eq!(def.render(&json!({"start": 3})), Node::text("3"));
        assert!(registry.get("Nope").is_none());
    }
}

//! Server-side view tree.
//!
//! Route modules describe their markup as a [`Node`] tree which the renderer
//! serializes to HTML. Besides plain elements and text the tree has two special
//! node kinds:
//!
//! - [`Node::Island`] names a registered island; the writer renders its server
//!   markup inside a wrapper and emits the hydration marker in front of it.
//! - [`Node::Dynamic`] is a per-request region. Outside partial prerendering it
//!   renders inline; in a PPR shell it is replaced by its fallback between
//!   `<!--__PPR_START__:id-->` and `<!--__PPR_END__:id-->` comments.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::RenderError;
use crate::context::LoaderContext;
use crate::islands::{Island, IslandRegistry, encode_marker};

/// Renders a dynamic region for one request.
pub type DynamicRender = Arc<dyn Fn(&LoaderContext) -> Node + Send + Sync>;

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

/// A node of the server view tree.
///
/// # Examples
///
/// ```
/// use islet::islands::IslandRegistry;
/// use islet::render::view::{Node, render_to_string};
///
/// let page = Node::element("ul")
///     .attr("class", "posts")
///     .child(Node::element("li").child(Node::text("Fish & <Chips>")));
///
/// let html = render_to_string(&page, &IslandRegistry::new()).unwrap();
/// assert_eq!(html, r#"<ul class="posts"><li>Fish &amp; &lt;Chips&gt;</li></ul>"#);
/// ```
#[derive(Clone)]
pub enum Node {
    Element {
        tag: String,
        attrs: Vec<(String, String)>,
        children: Vec<Node>,
    },
    /// Escaped text.
    Text(String),
    /// Trusted markup written as-is.
    Raw(String),
    Fragment(Vec<Node>),
    Island {
        name: String,
        props: Value,
        id: Option<String>,
    },
    Dynamic {
        id: String,
        fallback: Box<Node>,
        render: DynamicRender,
    },
}

impl Node {
    pub fn element(tag: impl Into<String>) -> Self {
        Self::Element {
            tag: tag.into(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn raw(html: impl Into<String>) -> Self {
        Self::Raw(html.into())
    }

    pub fn fragment(children: impl IntoIterator<Item = Node>) -> Self {
        Self::Fragment(children.into_iter().collect())
    }

    /// A registered island with a generated id.
    pub fn island(name: impl Into<String>, props: Value) -> Self {
        Self::Island {
            name: name.into(),
            props,
            id: None,
        }
    }

    /// A registered island with an explicit id.
    pub fn island_with_id(name: impl Into<String>, id: impl Into<String>, props: Value) -> Self {
        Self::Island {
            name: name.into(),
            props,
            id: Some(id.into()),
        }
    }

    pub fn dynamic<F>(id: impl Into<String>, fallback: Node, render: F) -> Self
    where
        F: Fn(&LoaderContext) -> Node + Send + Sync + 'static,
    {
        Self::Dynamic {
            id: id.into(),
            fallback: Box::new(fallback),
            render: Arc::new(render),
        }
    }

    /// Adds an attribute. No-op on anything but an element.
    #[must_use]
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        if let Self::Element { attrs, .. } = &mut self {
            attrs.push((name.into(), value.into()));
        }
        self
    }

    /// Appends a child to an element or fragment.
    #[must_use]
    pub fn child(mut self, node: Node) -> Self {
        match &mut self {
            Self::Element { children, .. } | Self::Fragment(children) => children.push(node),
            _ => {}
        }
        self
    }

    #[must_use]
    pub fn children(self, nodes: impl IntoIterator<Item = Node>) -> Self {
        nodes.into_iter().fold(self, Self::child)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Element { tag, attrs, children },
                Self::Element {
                    tag: t2,
                    attrs: a2,
                    children: c2,
                },
            ) => tag == t2 && attrs == a2 && children == c2,
            (Self::Text(a), Self::Text(b)) | (Self::Raw(a), Self::Raw(b)) => a == b,
            (Self::Fragment(a), Self::Fragment(b)) => a == b,
            (
                Self::Island { name, props, id },
                Self::Island {
                    name: n2,
                    props: p2,
                    id: i2,
                },
            ) => name == n2 && props == p2 && id == i2,
            (
                Self::Dynamic { id, fallback, render },
                Self::Dynamic {
                    id: i2,
                    fallback: f2,
                    render: r2,
                },
            ) => id == i2 && fallback == f2 && Arc::ptr_eq(render, r2),
            _ => false,
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Element { tag, attrs, children } => f
                .debug_struct("Element")
                .field("tag", tag)
                .field("attrs", attrs)
                .field("children", children)
                .finish(),
            Self::Text(t) => f.debug_tuple("Text").field(t).finish(),
            Self::Raw(r) => f.debug_tuple("Raw").field(r).finish(),
            Self::Fragment(c) => f.debug_tuple("Fragment").field(c).finish(),
            Self::Island { name, props, id } => f
                .debug_struct("Island")
                .field("name", name)
                .field("props", props)
                .field("id", id)
                .finish(),
            Self::Dynamic { id, fallback, .. } => f
                .debug_struct("Dynamic")
                .field("id", id)
                .field("fallback", fallback)
                .finish_non_exhaustive(),
        }
    }
}

impl From<&str> for Node {
    fn from(text: &str) -> Self {
        Self::text(text)
    }
}

impl From<String> for Node {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

/// Escapes text and attribute values.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// How [`Node::Dynamic`] regions are written.
pub(crate) enum Regions<'c> {
    /// Render in place against this context.
    Inline(&'c LoaderContext),
    /// Write the fallback between PPR markers and collect the renderer.
    Shell(Vec<(String, DynamicRender)>),
}

/// Island ids handed out on one page.
///
/// Generated ids are `{lowercased-name}-{n}` and skip anything already taken;
/// an explicit id that is already taken is an error.
#[derive(Debug, Clone, Default)]
pub(crate) struct IslandIds {
    counters: HashMap<String, usize>,
    used: HashSet<String>,
}

impl IslandIds {
    fn assign(&mut self, name: &str, explicit: Option<&str>) -> Result<String, RenderError> {
        let id = match explicit {
            Some(id) => id.to_owned(),
            None => {
                let key = name.to_ascii_lowercase();
                let n = self.counters.entry(key.clone()).or_insert(0);
                loop {
                    let id = format!("{key}-{n}");
                    *n += 1;
                    if !self.used.contains(&id) {
                        break id;
                    }
                }
            }
        };
        if !self.used.insert(id.clone()) {
            return Err(RenderError::DuplicateIslandId(id));
        }
        Ok(id)
    }
}

/// Serializes a view tree, tracking island ids and discovered islands.
pub(crate) struct HtmlWriter<'r, 'c> {
    registry: &'r IslandRegistry,
    ids: IslandIds,
    region_ids: HashSet<String>,
    regions: Regions<'c>,
    islands: Vec<Island>,
    out: String,
}

impl<'r, 'c> HtmlWriter<'r, 'c> {
    pub(crate) fn new(registry: &'r IslandRegistry, regions: Regions<'c>) -> Self {
        Self {
            registry,
            ids: IslandIds::default(),
            region_ids: HashSet::new(),
            regions,
            islands: Vec::new(),
            out: String::new(),
        }
    }

    /// Continues island numbering from an earlier pass over the same page.
    pub(crate) fn with_ids(mut self, ids: IslandIds) -> Self {
        self.ids = ids;
        self
    }

    pub(crate) fn write(&mut self, node: &Node) -> Result<(), RenderError> {
        match node {
            Node::Element { tag, attrs, children } => {
                self.out.push('<');
                self.out.push_str(tag);
                for (name, value) in attrs {
                    self.out.push(' ');
                    self.out.push_str(name);
                    self.out.push_str("=\"");
                    self.out.push_str(&escape_html(value));
                    self.out.push('"');
                }
                self.out.push('>');
                if VOID_ELEMENTS.contains(&tag.to_ascii_lowercase().as_str()) {
                    return Ok(());
                }
                for child in children {
                    self.write(child)?;
                }
                self.out.push_str("</");
                self.out.push_str(tag);
                self.out.push('>');
            }
            Node::Text(text) => self.out.push_str(&escape_html(text)),
            Node::Raw(html) => self.out.push_str(html),
            Node::Fragment(children) => {
                for child in children {
                    self.write(child)?;
                }
            }
            Node::Island { name, props, id } => self.write_island(name, props, id.as_deref())?,
            Node::Dynamic { id, fallback, render } => {
                if !self.region_ids.insert(id.clone()) {
                    return Err(RenderError::DuplicateRegion(id.clone()));
                }
                self.write_region(id, fallback, render)?;
            }
        }
        Ok(())
    }

    fn write_region(
        &mut self,
        id: &str,
        fallback: &Node,
        render: &DynamicRender,
    ) -> Result<(), RenderError> {
        match &mut self.regions {
            Regions::Inline(ctx) => {
                let node = render(*ctx);
                self.write(&node)?;
            }
            Regions::Shell(collected) => {
                collected.push((id.to_owned(), Arc::clone(render)));
                self.out.push_str(&ppr_start(id));
                self.write(fallback)?;
                self.out.push_str(&ppr_end(id));
            }
        }
        Ok(())
    }

    fn write_island(
        &mut self,
        name: &str,
        props: &Value,
        id: Option<&str>,
    ) -> Result<(), RenderError> {
        let def = self
            .registry
            .get(name)
            .ok_or_else(|| RenderError::UnknownIsland(name.to_owned()))?;

        let id = self.ids.assign(name, id)?;
        let island = Island {
            id,
            component: def.component().to_owned(),
            strategy: def.strategy(),
            props: props.clone(),
        };
        self.out.push_str(&encode_marker(&island)?);
        self.out.push_str("<div id=\"");
        self.out.push_str(&escape_html(&island.id));
        self.out.push_str("\" data-island=\"");
        self.out.push_str(&escape_html(name));
        self.out.push_str("\">");
        let markup = def.render(props);
        self.write(&markup)?;
        self.out.push_str("</div>");
        self.islands.push(island);
        Ok(())
    }

    pub(crate) fn finish(self) -> WriterOutput {
        let regions = match self.regions {
            Regions::Inline(_) => Vec::new(),
            Regions::Shell(collected) => collected,
        };
        WriterOutput {
            html: self.out,
            islands: self.islands,
            regions,
            ids: self.ids,
        }
    }
}

pub(crate) struct WriterOutput {
    pub html: String,
    pub islands: Vec<Island>,
    pub regions: Vec<(String, DynamicRender)>,
    pub ids: IslandIds,
}

pub(crate) fn ppr_start(id: &str) -> String {
    format!("<!--__PPR_START__:{id}-->")
}

pub(crate) fn ppr_end(id: &str) -> String {
    format!("<!--__PPR_END__:{id}-->")
}

/// Renders a tree that has no dynamic regions, or whose regions only need
/// their fallback.
///
/// # Errors
///
/// [`RenderError::UnknownIsland`] or [`RenderError::Marker`].
pub fn render_to_string(node: &Node, registry: &IslandRegistry) -> Result<String, RenderError> {
    let mut writer = HtmlWriter::new(registry, Regions::Shell(Vec::new()));
    writer.write(node)?;
    Ok(writer.finish().html)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{MemoryStore, Params};
    use crate::http::{Method, Request};
    use crate::islands::{IslandDef, Strategy};
    use serde_json::json;

    fn registry() -> IslandRegistry {
        let mut r = IslandRegistry::new();
        r.register(IslandDef::new(
            "Counter",
            "/components/Counter.tsx",
            Strategy::Load,
            |props: &Value| {
                Node::element("button").child(Node::text(format!("{}", props["start"])))
            },
        ));
        r
    }

    fn loader_ctx() -> LoaderContext {
        LoaderContext::from_request(
            &Request::new(Method::Get, "/?user=ada"),
            Params::new(),
            Arc::new(MemoryStore::new()),
        )
    }

    #[test]
    fn void_elements_have_no_closing_tag() {
        let html = render_to_string(
            &Node::fragment([Node::element("br"), Node::element("img").attr("alt", "\"x\"")]),
            &IslandRegistry::new(),
        )
        .unwrap();
        assert_eq!(html, r#"<br><img alt="&quot;x&quot;">"#);
    }

    #[test]
    fn raw_is_not_escaped() {
        let html = render_to_string(&Node::raw("<em>ok</em>"), &IslandRegistry::new()).unwrap();
        assert_eq!(html, "<em>ok</em>");
    }

    #[test]
    fn islands_get_markers_wrappers_and_sequential_ids() {
        let page = Node::fragment([
            Node::island("Counter", json!({"start": 1})),
            Node::island("Counter", json!({"start": 2})),
            Node::island_with_id("Counter", "main", json!({"start": 3})),
        ]);
        let reg = registry();
        let mut writer = HtmlWriter::new(&reg, Regions::Shell(Vec::new()));
        writer.write(&page).unwrap();
        let out = writer.finish();

        let ids: Vec<_> = out.islands.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["counter-0", "counter-1", "main"]);
        let marker = r#"<!--__ISLAND_LOAD__:counter-0:/components/Counter.tsx:{"start":1}-->"#;
        let markup = r#"<div id="counter-0" data-island="Counter"><button>1</button></div>"#;
        assert!(out.html.starts_with(&format!("{marker}{markup}")));
    }

    #[test]
    fn unknown_island_is_an_error() {
        let err = render_to_string(&Node::island("Ghost", json!(null)), &registry()).unwrap_err();
        assert!(matches!(err, RenderError::UnknownIsland(ref n) if n == "Ghost"));
    }

    #[test]
    fn bad_island_id_is_an_error() {
        let err = render_to_string(
            &Node::island_with_id("Counter", "a:b", json!(null)),
            &registry(),
        )
        .unwrap_err();
        assert!(matches!(err, RenderError::Marker(_)));
    }

    #[test]
    fn dynamic_inline_uses_request_context() {
        let node = Node::dynamic("greeting", Node::text("…"), |ctx: &LoaderContext| {
            Node::text(format!("hi {}", ctx.query().get("user").map_or("", String::as_str)))
        });
        let ctx = loader_ctx();
        let reg = IslandRegistry::new();
        let mut writer = HtmlWriter::new(&reg, Regions::Inline(&ctx));
        writer.write(&node).unwrap();
        assert_eq!(writer.finish().html, "hi ada");
    }

    #[test]
    fn dynamic_shell_writes_fallback_between_markers() {
        let node = Node::element("main").child(Node::dynamic(
            "cart",
            Node::text("loading"),
            |_: &LoaderContext| Node::text("3 items"),
        ));
        let reg = IslandRegistry::new();
        let mut writer = HtmlWriter::new(&reg, Regions::Shell(Vec::new()));
        writer.write(&node).unwrap();
        let out = writer.finish();
        assert_eq!(
            out.html,
            "<main><!--__PPR_START__:cart-->loading<!--__PPR_END__:cart--></main>"
        );
        assert_eq!(out.regions.len(), 1);
        assert_eq!(out.regions[0].0, "cart");
    }

    #[test]
    fn generated_ids_skip_explicit_ones() {
        let page = Node::fragment([
            Node::island_with_id("Counter", "counter-0", json!({"start": 1})),
            Node::island("Counter", json!({"start": 2})),
        ]);
        let reg = registry();
        let mut writer = HtmlWriter::new(&reg, Regions::Shell(Vec::new()));
        writer.write(&page).unwrap();
        let ids: Vec<_> = writer.finish().islands.into_iter().map(|i| i.id).collect();
        assert_eq!(ids, ["counter-0", "counter-1"]);
    }

    #[test]
    fn duplicate_island_ids_are_rejected() {
        let page = Node::fragment([
            Node::island("Counter", json!({"start": 1})),
            Node::island_with_id("Counter", "counter-0", json!({"start": 2})),
        ]);
        let err = render_to_string(&page, &registry()).unwrap_err();
        assert!(matches!(err, RenderError::DuplicateIslandId(ref id) if id == "counter-0"));
    }

    #[test]
    fn duplicate_region_ids_are_rejected() {
        let region =
            || Node::dynamic("cart", Node::text("loading"), |_: &LoaderContext| Node::text("x"));
        let tree = Node::fragment([region(), region()]);
        let err = render_to_string(&tree, &IslandRegistry::new()).unwrap_err();
        assert!(matches!(err, RenderError::DuplicateRegion(ref id) if id == "cart"));

        let ctx = loader_ctx();
        let reg = IslandRegistry::new();
        let mut writer = HtmlWriter::new(&reg, Regions::Inline(&ctx));
        assert!(writer.write(&Node::fragment([region(), region()])).is_err());
    }

    #[test]
    fn builders_ignore_non_containers() {
        assert_eq!(Node::text("a").attr("x", "y").child(Node::text("b")), Node::text("a"));
        assert_eq!(
            Node::element("p").children(["a".into(), "b".into()]),
            Node::element("p").child(Node::text("a")).child(Node::text("b"))
        );
    }
}

//! Per-request state handed to route middleware and loaders.
//!
//! ```text
//! Request + MatchResult
//!     → MiddlewareContext   (mutable; middleware may write data, headers, or short-circuit)
//!     → LoaderContext       (owned snapshot; cloned into background ISR renders)
//! ```

pub mod store;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::ser::SerializeMap;
use serde_json::{Map, Value};
use tracing::warn;

use crate::http::{Method, Request, Response, StatusCode};

pub use store::{MemoryStore, Store};

/// Path parameters extracted from the matched route, in pattern order.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Parameters {
    pairs: Vec<(String, String)>,
}

/// Shorter name used throughout the crate.
pub type Params = Parameters;

impl Parameters {
    pub fn new() -> Self {
        Self { pairs: Vec::new() }
    }

    /// Inserts a parameter, replacing an existing value with the same name.
    pub fn insert(&mut self, key: String, value: String) {
        match self.pairs.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.pairs.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Parameters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Self::new();
        for (k, v) in iter {
            params.insert(k.into(), v.into());
        }
        params
    }
}

// Serialized as a JSON object, keeping pattern order.
impl Serialize for Parameters {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.pairs.len()))?;
        for (k, v) in &self.pairs {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// Which short-circuit a middleware raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortCircuit {
    Redirect,
    Json,
    /// A bodiless answer, such as a CORS preflight.
    Empty,
}

/// Mutable context shared by a route's middleware chain.
///
/// Request-derived fields (`url`, `params`, `query`, `headers`, `cookies`) are
/// read-only. `data` is an open JSON map whose contents reach the loader through
/// [`LoaderContext::data`]. [`redirect`](Self::redirect), [`json`](Self::json) and
/// [`respond`](Self::respond) write the final response and raise the
/// short-circuit flag; once raised the executor stops the chain and the page is
/// never rendered.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use islet::context::{MemoryStore, MiddlewareContext, Params, ShortCircuit};
/// use islet::http::{Method, Request, StatusCode};
///
/// let request = Request::new(Method::Get, "/admin?tab=users");
/// let mut ctx = MiddlewareContext::new(&request, Params::new(), Arc::new(MemoryStore::new()));
///
/// assert_eq!(ctx.query().get("tab").map(String::as_str), Some("users"));
/// ctx.redirect("/login");
///
/// assert_eq!(ctx.short_circuit(), Some(ShortCircuit::Redirect));
/// let response = ctx.into_response();
/// assert_eq!(response.status(), StatusCode::Found);
/// assert_eq!(response.headers().get("location"), Some("/login"));
/// ```
pub struct MiddlewareContext {
    method: Method,
    url: String,
    path: String,
    params: Params,
    query: BTreeMap<String, String>,
    headers: BTreeMap<String, String>,
    cookies: BTreeMap<String, String>,
    data: Map<String, Value>,
    store: Arc<dyn Store>,
    response: Response,
    short_circuit: Option<ShortCircuit>,
}

impl MiddlewareContext {
    pub fn new(request: &Request, params: Params, store: Arc<dyn Store>) -> Self {
        Self {
            method: request.method().clone(),
            url: request.target(),
            path: request.path().to_owned(),
            params,
            query: request.query().clone(),
            headers: request.headers().to_map(),
            cookies: request.cookies().clone(),
            data: Map::new(),
            store,
            response: Response::new(StatusCode::Ok),
            short_circuit: None,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Path plus query exactly as requested.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn query(&self) -> &BTreeMap<String, String> {
        &self.query
    }

    /// Request headers keyed by lowercase name.
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn cookies(&self) -> &BTreeMap<String, String> {
        &self.cookies
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.data
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// The response written so far.
    pub fn response(&self) -> &Response {
        &self.response
    }

    /// Sets the status of the eventual response without short-circuiting.
    pub fn status(&mut self, status: StatusCode) -> &mut Self {
        self.response.set_status(status);
        self
    }

    /// Sets a response header, kept on the rendered page as well.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.response.set_header(name, value);
        self
    }

    /// Redirects with `302 Found` and stops the chain.
    pub fn redirect(&mut self, location: &str) {
        self.redirect_with(location, StatusCode::Found);
    }

    /// Redirects with a chosen status and stops the chain.
    pub fn redirect_with(&mut self, location: &str, status: StatusCode) {
        self.response.set_status(status);
        self.response.set_header("Location", location);
        self.response.set_body(Vec::new());
        self.short_circuit = Some(ShortCircuit::Redirect);
    }

    /// Responds with `value` as JSON (`200 OK`) and stops the chain.
    pub fn json<T: Serialize + ?Sized>(&mut self, value: &T) {
        self.json_with(value, StatusCode::Ok);
    }

    /// Responds with `value` as JSON and a chosen status, then stops the chain.
    ///
    /// A value that fails to serialize is answered with `500` and a JSON error
    /// body instead.
    pub fn json_with<T: Serialize + ?Sized>(&mut self, value: &T, status: StatusCode) {
        let (body, status) = match serde_json::to_vec(value) {
            Ok(body) => (body, status),
            Err(e) => {
                warn!(
                    path = %self.path,
                    error = %e,
                    "middleware json response failed to serialize"
                );
                (
                    br#"{"error":"Internal Server Error"}"#.to_vec(),
                    StatusCode::InternalServerError,
                )
            }
        };
        self.response.set_status(status);
        self.response
            .set_header("Content-Type", "application/json; charset=utf-8");
        self.response.set_body(body);
        self.short_circuit = Some(ShortCircuit::Json);
    }

    /// Answers with `status` and no body, then stops the chain. Headers set
    /// earlier are kept.
    pub fn respond(&mut self, status: StatusCode) {
        self.response.set_status(status);
        self.response.set_body(Vec::new());
        self.short_circuit = Some(ShortCircuit::Empty);
    }

    /// The raised short-circuit, if any.
    pub fn short_circuit(&self) -> Option<ShortCircuit> {
        self.short_circuit
    }

    /// Snapshot for the loader and renderer.
    pub fn to_loader_context(&self) -> LoaderContext {
        LoaderContext {
            url: self.url.clone(),
            path: self.path.clone(),
            params: self.params.clone(),
            query: self.query.clone(),
            headers: self.headers.clone(),
            cookies: self.cookies.clone(),
            data: self.data.clone(),
            store: Arc::clone(&self.store),
        }
    }

    pub fn into_response(self) -> Response {
        self.response
    }
}

impl fmt::Debug for MiddlewareContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareContext")
            .field("url", &self.url)
            .field("params", &self.params)
            .field("data", &self.data)
            .field("short_circuit", &self.short_circuit)
            .finish_non_exhaustive()
    }
}

/// Owned, cloneable view of one request for loaders and dynamic regions.
#[derive(Clone)]
pub struct LoaderContext {
    url: String,
    path: String,
    params: Params,
    query: BTreeMap<String, String>,
    headers: BTreeMap<String, String>,
    cookies: BTreeMap<String, String>,
    data: Map<String, Value>,
    store: Arc<dyn Store>,
}

impl LoaderContext {
    /// Builds a context straight from a request, with no middleware data.
    pub fn from_request(request: &Request, params: Params, store: Arc<dyn Store>) -> Self {
        MiddlewareContext::new(request, params, store).to_loader_context()
    }

    /// The request-independent part of this context: path, params and store.
    ///
    /// Cached renders run against this so nothing from one visitor's query,
    /// headers, cookies or middleware data ends up in a page served to another.
    pub fn shared(&self) -> LoaderContext {
        LoaderContext {
            url: self.path.clone(),
            path: self.path.clone(),
            params: self.params.clone(),
            query: BTreeMap::new(),
            headers: BTreeMap::new(),
            cookies: BTreeMap::new(),
            data: Map::new(),
            store: Arc::clone(&self.store),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    pub fn query(&self) -> &BTreeMap<String, String> {
        &self.query
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn cookies(&self) -> &BTreeMap<String, String> {
        &self.cookies
    }

    /// Values written by middleware.
    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }
}

impl fmt::Debug for LoaderContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderContext")
            .field("url", &self.url)
            .field("params", &self.params)
            .field("query", &self.query)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(target: &str) -> MiddlewareContext {
        let request = Request::new(Method::Get, target)
            .with_header("Cookie", "session=abc")
            .with_header("X-Trace", "t1");
        let params: Params = [("slug", "hello")].into_iter().collect();
        MiddlewareContext::new(&request, params, Arc::new(MemoryStore::new()))
    }

    // ── Parameters ────────────────────────────────────────────────────────────

    #[test]
    fn params_keep_insertion_order_and_replace() {
        let mut p = Params::new();
        p.insert("b".into(), "1".into());
        p.insert("a".into(), "2".into());
        p.insert("b".into(), "3".into());
        assert_eq!(p.iter().collect::<Vec<_>>(), vec![("b", "3"), ("a", "2")]);
        assert_eq!(serde_json::to_string(&p).unwrap(), r#"{"b":"3","a":"2"}"#);
    }

    // ── MiddlewareContext ─────────────────────────────────────────────────────

    #[test]
    fn request_fields_derived() {
        let c = ctx("/blog/hello?page=2");
        assert_eq!(c.url(), "/blog/hello?page=2");
        assert_eq!(c.path(), "/blog/hello");
        assert_eq!(c.params().get("slug"), Some("hello"));
        assert_eq!(c.query()["page"], "2");
        assert_eq!(c.cookies()["session"], "abc");
        assert_eq!(c.header("x-trace"), Some("t1"));
        assert!(c.short_circuit().is_none());
    }

    #[test]
    fn status_and_headers_do_not_short_circuit() {
        let mut c = ctx("/");
        c.status(StatusCode::Accepted).set_header("X-Frame", "deny");
        assert!(c.short_circuit().is_none());
        assert_eq!(c.response().status(), StatusCode::Accepted);
        assert_eq!(c.response().headers().get("x-frame"), Some("deny"));
    }

    #[test]
    fn json_short_circuits() {
        let mut c = ctx("/");
        c.json_with(&json!({"error": "nope"}), StatusCode::Forbidden);
        assert_eq!(c.short_circuit(), Some(ShortCircuit::Json));
        let r = c.into_response();
        assert_eq!(r.status(), StatusCode::Forbidden);
        assert_eq!(r.body_text(), r#"{"error":"nope"}"#);
    }

    #[test]
    fn redirect_with_custom_status() {
        let mut c = ctx("/");
        c.redirect_with("/new", StatusCode::MovedPermanently);
        assert_eq!(c.short_circuit(), Some(ShortCircuit::Redirect));
        assert_eq!(c.response().headers().get("location"), Some("/new"));
    }

    #[test]
    fn loader_context_snapshots_data() {
        let mut c = ctx("/blog/hello");
        c.data_mut().insert("user".into(), json!("ada"));
        let loader = c.to_loader_context();
        c.data_mut().insert("late".into(), json!(true));

        assert_eq!(loader.data()["user"], json!("ada"));
        assert!(!loader.data().contains_key("late"));
        assert_eq!(loader.param("slug"), Some("hello"));
    }

    #[test]
    fn shared_context_drops_request_state() {
        let mut c = ctx("/blog/hello?token=secret");
        c.data_mut().insert("user".into(), json!("ada"));
        let shared = c.to_loader_context().shared();

        assert_eq!(shared.url(), "/blog/hello");
        assert_eq!(shared.param("slug"), Some("hello"));
        assert!(shared.query().is_empty());
        assert!(shared.cookies().is_empty());
        assert!(shared.headers().is_empty());
        assert!(shared.data().is_empty());
    }

    #[test]
    fn unserializable_json_is_a_500() {
        let mut bad = std::collections::HashMap::new();
        bad.insert((1, 2), "tuple keys are not JSON object keys");
        let mut c = ctx("/");
        c.json(&bad);
        assert_eq!(c.short_circuit(), Some(ShortCircuit::Json));
        let r = c.into_response();
        assert_eq!(r.status(), StatusCode::InternalServerError);
        assert_eq!(r.body_text(), r#"{"error":"Internal Server Error"}"#);
    }

    #[test]
    fn respond_keeps_headers_and_drops_body() {
        let mut c = ctx("/");
        assert_eq!(c.method(), &Method::Get);
        c.set_header("Access-Control-Allow-Origin", "*");
        c.respond(StatusCode::NoContent);
        assert_eq!(c.short_circuit(), Some(ShortCircuit::Empty));
        let r = c.into_response();
        assert_eq!(r.status(), StatusCode::NoContent);
        assert_eq!(r.headers().get("access-control-allow-origin"), Some("*"));
        assert!(r.body_bytes().is_empty());
    }

    #[test]
    fn store_is_shared_not_copied() {
        let c = ctx("/");
        let loader = c.to_loader_context();
        c.store().set("k", json!(1));
        assert_eq!(loader.store().get("k"), Some(json!(1)));
    }
}

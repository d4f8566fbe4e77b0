//! API route dispatch.
//!
//! Requests under the configured prefix (default `/api/`) are routed by the
//! remainder of the path: `/api/users/list` dispatches to the handler named
//! `users/list`, and the bare prefix dispatches to `home`.
//!
//! ```text
//! Request
//!     → api_name        (400 on a malformed name)
//!     → ApiRegistry     (404 when nothing is registered)
//!     → read_body       (413 over 1 MiB; JSON or {"__raw": text})
//!     → ApiHandler      (any IntoResponse)
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde_json::{Value, json};
use tracing::debug;

use crate::BoxFuture;
use crate::context::Store;
use crate::http::{Method, Request, Response, StatusCode};

/// Largest request body an API handler will be given.
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

const MAX_NAME_LEN: usize = 255;

static VALID_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_\-/]+$").expect("api name regex"));

/// What an API handler receives.
#[derive(Clone)]
pub struct ApiContext {
    method: Method,
    path: String,
    name: String,
    query: BTreeMap<String, String>,
    headers: BTreeMap<String, String>,
    body: Value,
    store: Arc<dyn Store>,
}

impl ApiContext {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The handler name the request was dispatched by.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn query(&self) -> &BTreeMap<String, String> {
        &self.query
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    /// Request headers, names lowercased.
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Parsed request body.
    ///
    /// `null` for `GET`, `HEAD` and empty bodies. JSON bodies are parsed;
    /// anything else (or JSON that fails to parse) arrives as `{"__raw": text}`.
    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }
}

impl fmt::Debug for ApiContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiContext")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("name", &self.name)
            .field("query", &self.query)
            .field("body", &self.body)
            .finish_non_exhaustive()
    }
}

/// Values an API handler may return.
///
/// Strings become `text/plain`, JSON values become `application/json`, both
/// with status 200.
pub trait IntoResponse {
    fn into_response(self) -> Response;
}

impl IntoResponse for Response {
    fn into_response(self) -> Response {
        self
    }
}

impl IntoResponse for String {
    fn into_response(self) -> Response {
        Response::text(StatusCode::Ok, self)
    }
}

impl IntoResponse for &'static str {
    fn into_response(self) -> Response {
        Response::text(StatusCode::Ok, self)
    }
}

impl IntoResponse for Value {
    fn into_response(self) -> Response {
        Response::json(StatusCode::Ok, &self)
    }
}

/// Conversion trait for async API handler functions.
///
/// Implemented for every `Fn(ApiContext) -> impl Future<Output = impl IntoResponse>`
/// that is `Send + Sync + 'static`.
pub trait ApiHandler: Send + Sync + 'static {
    fn call(&self, ctx: ApiContext) -> BoxFuture<'static, Response>;
}

impl<T, F, R> ApiHandler for T
where
    T: Fn(ApiContext) -> F + Send + Sync + 'static,
    F: Future<Output = R> + Send + 'static,
    R: IntoResponse,
{
    fn call(&self, ctx: ApiContext) -> BoxFuture<'static, Response> {
        let fut = (self)(ctx);
        Box::pin(async move { fut.await.into_response() })
    }
}

/// API handlers by name.
#[derive(Clone, Default)]
pub struct ApiRegistry {
    handlers: HashMap<String, Arc<dyn ApiHandler>>,
}

impl ApiRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name` (`users/list`, `home`, ...).
    pub fn register(&mut self, name: impl Into<String>, handler: impl ApiHandler) -> &mut Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Answers a request whose path starts with `prefix`.
    ///
    /// Never fails: malformed names, unknown handlers and oversized bodies are
    /// answered with JSON error bodies.
    pub async fn dispatch(
        &self,
        prefix: &str,
        request: &Request,
        store: Arc<dyn Store>,
    ) -> Response {
        let name = match api_name(request.path(), prefix) {
            Some(name) => name,
            None => return error(StatusCode::BadRequest, "Invalid API route format"),
        };
        let Some(handler) = self.handlers.get(&name) else {
            debug!(name = %name, "no api handler");
            return error(StatusCode::NotFound, "Not found");
        };
        let body = match read_body(request) {
            Ok(body) => body,
            Err(response) => return response,
        };

        let ctx = ApiContext {
            method: request.method().clone(),
            path: request.path().to_owned(),
            name,
            query: request.query().clone(),
            headers: request.headers().to_map(),
            body,
            store,
        };
        handler.call(ctx).await
    }
}

impl fmt::Debug for ApiRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("ApiRegistry").field("handlers", &names).finish()
    }
}

/// Handler name for `path`, or `None` when it is malformed.
///
/// The bare prefix maps to `home`; one trailing slash is ignored.
///
/// # Examples
///
/// ```
/// use islet::app::api::api_name;
///
/// assert_eq!(api_name("/api/", "/api/").as_deref(), Some("home"));
/// assert_eq!(api_name("/api/users/list", "/api/").as_deref(), Some("users/list"));
/// assert_eq!(api_name("/api/../secret", "/api/"), None);
/// ```
pub fn api_name(path: &str, prefix: &str) -> Option<String> {
    let rest = path
        .strip_prefix(prefix)
        .or_else(|| (path == prefix.trim_end_matches('/')).then_some(""))?;
    let rest = rest.strip_suffix('/').unwrap_or(rest);
    let name = if rest.is_empty() { "home" } else { rest };

    let valid = name.len() <= MAX_NAME_LEN
        && !name.contains("..")
        && !name.starts_with('/')
        && VALID_NAME.is_match(name);
    valid.then(|| name.to_owned())
}

fn read_body(request: &Request) -> Result<Value, Response> {
    if request.method().is_read_only() {
        return Ok(Value::Null);
    }
    let bytes = request.body();
    if bytes.len() > MAX_BODY_SIZE {
        return Err(error(
            StatusCode::PayloadTooLarge,
            &format!("Request body exceeds maximum size of {MAX_BODY_SIZE} bytes"),
        ));
    }
    if bytes.is_empty() {
        return Ok(Value::Null);
    }

    let raw = String::from_utf8_lossy(bytes);
    let is_json = request
        .headers()
        .get("content-type")
        .is_some_and(|ct| ct.contains("application/json"));
    if is_json {
        if let Ok(value) = serde_json::from_str(&raw) {
            return Ok(value);
        }
    }
    Ok(json!({ "__raw": raw }))
}

fn error(status: StatusCode, message: &str) -> Response {
    Response::json(status, &json!({ "error": message }))
}

//! Built-in security middleware: CORS and response hardening headers.
//!
//! Both are meant for the app-wide chain registered with
//! [`AppBuilder::middleware`](crate::app::AppBuilder::middleware), but work in
//! a route's own chain too.

use crate::BoxFuture;
use crate::context::MiddlewareContext;
use crate::http::{Method, StatusCode};

use super::{Middleware, MiddlewareError};

/// Cross-Origin Resource Sharing.
///
/// # Behavior
///
/// - Without an `Origin` header, or with one that is not allowed, the request
///   passes through unmodified.
/// - `OPTIONS` preflights from an allowed origin are answered with
///   `204 No Content` and the `Access-Control-*` headers; nothing else runs.
/// - Other requests continue, and the page or API response carries the
///   `Access-Control-*` headers.
/// - A specific (non-wildcard) origin is echoed back with `Vary: Origin`.
///
/// # Examples
///
/// ```
/// use islet::middleware::security::Cors;
///
/// let cors = Cors::new()
///     .allow_origin("https://app.example.com")
///     .allow_method("PATCH")
///     .allow_header("X-Request-ID");
/// # let _ = cors;
/// ```
#[derive(Debug, Clone)]
pub struct Cors {
    allowed_origins: Vec<String>,
    allowed_methods: Vec<String>,
    allowed_headers: Vec<String>,
    max_age: u64,
}

impl Default for Cors {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_owned()],
            allowed_methods: ["GET", "POST", "PUT", "DELETE"]
                .map(str::to_owned)
                .to_vec(),
            allowed_headers: vec!["Content-Type".to_owned(), "Authorization".to_owned()],
            max_age: 3600,
        }
    }
}

impl Cors {
    /// Allows a fixed set of origins only. Add them with
    /// [`allow_origin`](Self::allow_origin).
    pub fn new() -> Self {
        Self {
            allowed_origins: Vec::new(),
            ..Self::default()
        }
    }

    /// Allows every origin, answering with `Access-Control-Allow-Origin: *`.
    pub fn permissive() -> Self {
        Self::default()
    }

    /// Adds an allowed origin; `"*"` allows all.
    #[must_use]
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.allowed_origins.push(origin.into());
        self
    }

    #[must_use]
    pub fn allow_method(mut self, method: impl Into<String>) -> Self {
        self.allowed_methods.push(method.into());
        self
    }

    #[must_use]
    pub fn allow_header(mut self, header: impl Into<String>) -> Self {
        self.allowed_headers.push(header.into());
        self
    }

    /// Seconds a browser may cache a preflight answer.
    #[must_use]
    pub fn max_age(mut self, seconds: u64) -> Self {
        self.max_age = seconds;
        self
    }

    fn allowed(&self, origin: &str) -> Option<String> {
        if self.allowed_origins.iter().any(|o| o == "*") {
            Some("*".to_owned())
        } else if self.allowed_origins.iter().any(|o| o == origin) {
            Some(origin.to_owned())
        } else {
            None
        }
    }
}

impl Middleware for Cors {
    fn handle<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
    ) -> BoxFuture<'a, Result<(), MiddlewareError>> {
        Box::pin(async move {
            let Some(allow_origin) = ctx.header("origin").and_then(|o| self.allowed(o)) else {
                return Ok(());
            };
            let wildcard = allow_origin == "*";

            ctx.set_header("Access-Control-Allow-Origin", allow_origin);
            ctx.set_header("Access-Control-Allow-Methods", self.allowed_methods.join(", "));
            ctx.set_header("Access-Control-Allow-Headers", self.allowed_headers.join(", "));
            if !wildcard {
                ctx.set_header("Vary", "Origin");
            }
            if *ctx.method() == Method::Options {
                ctx.set_header("Access-Control-Max-Age", self.max_age.to_string());
                ctx.respond(StatusCode::NoContent);
            }
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "cors"
    }
}

/// `X-Frame-Options` values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameGuard {
    Deny,
    SameOrigin,
}

impl FrameGuard {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deny => "DENY",
            Self::SameOrigin => "SAMEORIGIN",
        }
    }
}

/// Hardening headers set on every response that passes through.
///
/// The defaults send `X-Content-Type-Options: nosniff`,
/// `X-Frame-Options: SAMEORIGIN` and `Referrer-Policy:
/// strict-origin-when-cross-origin`. HSTS and a content security policy are
/// opt-in.
///
/// # Examples
///
/// ```
/// use islet::middleware::security::{FrameGuard, SecurityHeaders};
///
/// let headers = SecurityHeaders::default()
///     .frame_guard(FrameGuard::Deny)
///     .hsts(31_536_000)
///     .content_security_policy("default-src 'self'");
/// # let _ = headers;
/// ```
#[derive(Debug, Clone)]
pub struct SecurityHeaders {
    frame_guard: Option<FrameGuard>,
    nosniff: bool,
    referrer_policy: Option<String>,
    hsts_max_age: Option<u64>,
    csp: Option<String>,
}

impl Default for SecurityHeaders {
    fn default() -> Self {
        Self {
            frame_guard: Some(FrameGuard::SameOrigin),
            nosniff: true,
            referrer_policy: Some("strict-origin-when-cross-origin".to_owned()),
            hsts_max_age: None,
            csp: None,
        }
    }
}

impl SecurityHeaders {
    #[must_use]
    pub fn frame_guard(mut self, guard: FrameGuard) -> Self {
        self.frame_guard = Some(guard);
        self
    }

    /// Stops sending `X-Frame-Options`, for pages that are meant to be embedded.
    #[must_use]
    pub fn allow_framing(mut self) -> Self {
        self.frame_guard = None;
        self
    }

    #[must_use]
    pub fn referrer_policy(mut self, policy: impl Into<String>) -> Self {
        self.referrer_policy = Some(policy.into());
        self
    }

    /// Sends `Strict-Transport-Security: max-age={seconds}; includeSubDomains`.
    #[must_use]
    pub fn hsts(mut self, max_age_seconds: u64) -> Self {
        self.hsts_max_age = Some(max_age_seconds);
        self
    }

    #[must_use]
    pub fn content_security_policy(mut self, policy: impl Into<String>) -> Self {
        self.csp = Some(policy.into());
        self
    }
}

impl Middleware for SecurityHeaders {
    fn handle<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
    ) -> BoxFuture<'a, Result<(), MiddlewareError>> {
        Box::pin(async move {
            if self.nosniff {
                ctx.set_header("X-Content-Type-Options", "nosniff");
            }
            if let Some(guard) = &self.frame_guard {
                ctx.set_header("X-Frame-Options", guard.as_str());
            }
            if let Some(policy) = &self.referrer_policy {
                ctx.set_header("Referrer-Policy", policy.as_str());
            }
            if let Some(max_age) = self.hsts_max_age {
                ctx.set_header(
                    "Strict-Transport-Security",
                    format!("max-age={max_age}; includeSubDomains"),
                );
            }
            if let Some(csp) = &self.csp {
                ctx.set_header("Content-Security-Policy", csp.as_str());
            }
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "security-headers"
    }
}

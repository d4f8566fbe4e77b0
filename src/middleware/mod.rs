//! Route middleware and the chain executor.
//!
//! A route module returns an ordered list of [`MiddlewareHandler`]s. Before the
//! page renders, [`execute`] awaits them one at a time against a shared
//! [`MiddlewareContext`]. Each middleware may:
//!
//! - **Pass through**: return `Ok(())` without touching the context.
//! - **Annotate**: write into [`MiddlewareContext::data_mut`] for the loader, or
//!   set status and headers on the eventual page response.
//! - **Short-circuit**: call [`MiddlewareContext::redirect`],
//!   [`MiddlewareContext::json`] or [`MiddlewareContext::respond`]. The executor
//!   stops there and the page is not rendered.
//! - **Fail**: return an error, which becomes a 500.
//!
//! App-wide middleware registered on the builder runs first, through the same
//! executor, followed by the route's own chain. [`security`] holds the
//! built-in CORS and hardening-header middleware.

pub mod security;

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::BoxFuture;
use crate::context::{MiddlewareContext, ShortCircuit};

/// Failure raised by a middleware that did not short-circuit.
#[derive(Debug, Error)]
pub enum MiddlewareError {
    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl MiddlewareError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

/// How a chain run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOutcome {
    /// Every middleware ran; continue to the loader and renderer.
    Continue,
    /// A middleware wrote the final response.
    ShortCircuited(ShortCircuit),
}

/// The trait implemented by all route middleware.
///
/// # Contract
///
/// - Implementations **must** be `Send + Sync`; one instance serves every request
///   to the route, concurrently.
/// - The returned future borrows the context mutably until it resolves, so a
///   middleware cannot run concurrently with the next one.
///
/// # Examples
///
/// ```
/// use islet::BoxFuture;
/// use islet::context::MiddlewareContext;
/// use islet::middleware::{Middleware, MiddlewareError};
///
/// struct RequireSession;
///
/// impl Middleware for RequireSession {
///     fn handle<'a>(
///         &'a self,
///         ctx: &'a mut MiddlewareContext,
///     ) -> BoxFuture<'a, Result<(), MiddlewareError>> {
///         Box::pin(async move {
///             if !ctx.cookies().contains_key("session") {
///                 ctx.redirect("/login");
///             }
///             Ok(())
///         })
///     }
/// }
/// ```
pub trait Middleware: Send + Sync {
    fn handle<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
    ) -> BoxFuture<'a, Result<(), MiddlewareError>>;

    /// Name used in log lines.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// A type-erased, reference-counted middleware.
pub type MiddlewareHandler = Arc<dyn Middleware>;

struct FnMiddleware<F>(F);

impl<F> Middleware for FnMiddleware<F>
where
    F: for<'a> Fn(&'a mut MiddlewareContext) -> BoxFuture<'a, Result<(), MiddlewareError>>
        + Send
        + Sync,
{
    fn handle<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
    ) -> BoxFuture<'a, Result<(), MiddlewareError>> {
        (self.0)(ctx)
    }

    fn name(&self) -> &str {
        "fn"
    }
}

/// Wraps an async closure as a [`MiddlewareHandler`].
///
/// # Examples
///
/// ```
/// use islet::middleware::from_fn;
///
/// let stamp = from_fn(|ctx| {
///     Box::pin(async move {
///         ctx.data_mut().insert("stamped".into(), true.into());
///         Ok(())
///     })
/// });
/// # let _ = stamp;
/// ```
pub fn from_fn<F>(f: F) -> MiddlewareHandler
where
    F: for<'a> Fn(&'a mut MiddlewareContext) -> BoxFuture<'a, Result<(), MiddlewareError>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnMiddleware(f))
}

/// Runs `chain` in order against `ctx`.
///
/// The short-circuit flag is checked after every middleware, before its result
/// is looked at: a middleware that redirects and then returns an error still
/// short-circuits cleanly.
///
/// # Errors
///
/// The first [`MiddlewareError`] returned by a middleware that did not raise
/// the short-circuit flag. Later middleware do not run.
pub async fn execute(
    chain: &[MiddlewareHandler],
    ctx: &mut MiddlewareContext,
) -> Result<ChainOutcome, MiddlewareError> {
    for middleware in chain {
        let result = middleware.handle(ctx).await;
        if let Some(kind) = ctx.short_circuit() {
            debug!(
                middleware = middleware.name(),
                kind = ?kind,
                url = ctx.url(),
                "middleware short-circuited"
            );
            return Ok(ChainOutcome::ShortCircuited(kind));
        }
        result?;
    }
    Ok(ChainOutcome::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{MemoryStore, Params};
    use crate::http::{Method, Request, StatusCode};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx() -> MiddlewareContext {
        MiddlewareContext::new(
            &Request::new(Method::Get, "/admin"),
            Params::new(),
            Arc::new(MemoryStore::new()),
        )
    }

    fn counter(hits: &Arc<AtomicUsize>) -> MiddlewareHandler {
        let hits = Arc::clone(hits);
        from_fn(move |_ctx| {
            let hits = Arc::clone(&hits);
            Box::pin(async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn runs_in_order_and_passes_data() {
        let first = from_fn(|ctx| {
            Box::pin(async move {
                ctx.data_mut().insert("trail".into(), json!("a"));
                Ok(())
            })
        });
        let second = from_fn(|ctx| {
            Box::pin(async move {
                let prev = ctx.data()["trail"].as_str().unwrap_or_default().to_owned();
                ctx.data_mut().insert("trail".into(), json!(format!("{prev}b")));
                Ok(())
            })
        });

        let mut c = ctx();
        let outcome = execute(&[first, second], &mut c).await.unwrap();
        assert_eq!(outcome, ChainOutcome::Continue);
        assert_eq!(c.data()["trail"], json!("ab"));
    }

    #[tokio::test]
    async fn redirect_stops_the_chain() {
        let hits = Arc::new(AtomicUsize::new(0));
        let guard = from_fn(|ctx| {
            Box::pin(async move {
                ctx.redirect("/login");
                Ok(())
            })
        });

        let mut c = ctx();
        let outcome = execute(&[guard, counter(&hits)], &mut c).await.unwrap();

        assert_eq!(outcome, ChainOutcome::ShortCircuited(ShortCircuit::Redirect));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        let response = c.into_response();
        assert_eq!(response.status(), StatusCode::Found);
        assert_eq!(response.headers().get("location"), Some("/login"));
    }

    #[tokio::test]
    async fn json_short_circuit_wins_over_error_return() {
        let mw = from_fn(|ctx| {
            Box::pin(async move {
                ctx.json(&json!({"ok": false}));
                Err(MiddlewareError::msg("ignored"))
            })
        });
        let mut c = ctx();
        let outcome = execute(&[mw], &mut c).await.unwrap();
        assert_eq!(outcome, ChainOutcome::ShortCircuited(ShortCircuit::Json));
    }

    #[tokio::test]
    async fn error_propagates_and_stops() {
        let hits = Arc::new(AtomicUsize::new(0));
        let failing = from_fn(|_ctx| Box::pin(async { Err(MiddlewareError::msg("db down")) }));
        let mut c = ctx();
        let err = execute(&[failing, counter(&hits)], &mut c).await.unwrap_err();
        assert_eq!(err.to_string(), "db down");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_chain_continues() {
        let mut c = ctx();
        assert_eq!(execute(&[], &mut c).await.unwrap(), ChainOutcome::Continue);
    }

    struct Tagged;

    impl Middleware for Tagged {
        fn handle<'a>(
            &'a self,
            ctx: &'a mut MiddlewareContext,
        ) -> BoxFuture<'a, Result<(), MiddlewareError>> {
            Box::pin(async move {
                ctx.set_header("X-Tag", "1");
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn trait_implementors_compose_with_closures() {
        let hits = Arc::new(AtomicUsize::new(0));
        let chain: Vec<MiddlewareHandler> = vec![Arc::new(Tagged), counter(&hits)];
        let mut c = ctx();
        execute(&chain, &mut c).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(c.response().headers().get("x-tag"), Some("1"));
        assert!(chain[0].name().ends_with("Tagged"));
    }
}

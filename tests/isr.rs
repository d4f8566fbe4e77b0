//! ISR timing on a paused clock.

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use islet::app::App;
use islet::config::FrameworkConfig;
use islet::http::{Method, Request, Response};
use islet::render::LoaderError;
use islet::render::module::{Page, PageProps};
use islet::render::view::Node;
use serde_json::json;

fn cache(response: &Response) -> &str {
    response.headers().get("x-cache").unwrap_or_default()
}

fn isr_app(dir: &std::path::Path, loads: Arc<AtomicUsize>, fail_after: usize) -> App {
    fs::create_dir_all(dir.join("site/news")).unwrap();
    fs::write(dir.join("site/news/(index).tsx"), "").unwrap();

    App::builder(FrameworkConfig::default())
        .root(dir)
        .page(
            "news/(index).tsx",
            Page::new(|p: &PageProps| Ok(Node::text(format!("edition {}", p.data["edition"]))))
                .with_loader(move |_ctx| {
                    let edition = loads.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if edition > fail_after {
                            return Err(LoaderError::msg("feed unavailable"));
                        }
                        Ok(json!({ "edition": edition }))
                    }
                })
                .revalidate(10),
        )
        .build()
        .unwrap()
}

// Lets spawned revalidation tasks run to completion.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn stale_page_is_served_while_one_revalidation_runs() {
    let dir = tempfile::tempdir().unwrap();
    let loads = Arc::new(AtomicUsize::new(0));
    let app = isr_app(dir.path(), Arc::clone(&loads), usize::MAX);
    let news = || Request::new(Method::Get, "/news");

    let first = app.handle(news()).await;
    assert_eq!(cache(&first), "MISS");
    assert!(first.body_text().contains("edition 1"));

    tokio::time::advance(Duration::from_secs(5)).await;
    let fresh = app.handle(news()).await;
    assert_eq!(cache(&fresh), "HIT");
    assert_eq!(loads.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_secs(6)).await;
    let (stale_a, stale_b) = tokio::join!(app.handle(news()), app.handle(news()));
    assert_eq!(cache(&stale_a), "STALE");
    assert_eq!(cache(&stale_b), "STALE");
    assert!(stale_b.body_text().contains("edition 1"));

    settle().await;
    assert_eq!(loads.load(Ordering::SeqCst), 2, "exactly one background render");

    let renewed = app.handle(news()).await;
    assert_eq!(cache(&renewed), "HIT");
    assert!(renewed.body_text().contains("edition 2"));
}

#[tokio::test(start_paused = true)]
async fn failed_revalidation_keeps_serving_the_stale_page() {
    let dir = tempfile::tempdir().unwrap();
    let loads = Arc::new(AtomicUsize::new(0));
    let app = isr_app(dir.path(), Arc::clone(&loads), 1);
    let news = || Request::new(Method::Get, "/news");

    assert_eq!(cache(&app.handle(news()).await), "MISS");
    tokio::time::advance(Duration::from_secs(11)).await;

    assert_eq!(cache(&app.handle(news()).await), "STALE");
    settle().await;
    assert_eq!(loads.load(Ordering::SeqCst), 2);

    // The failed attempt released its slot, so the next stale hit retries.
    let again = app.handle(news()).await;
    assert_eq!(cache(&again), "STALE");
    assert!(again.body_text().contains("edition 1"));
    settle().await;
    assert_eq!(loads.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn zero_window_never_revalidates() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("site")).unwrap();
    fs::write(dir.path().join("site/(index).tsx"), "").unwrap();

    let loads = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&loads);
    let app = App::builder(FrameworkConfig::default())
        .root(dir.path())
        .page(
            "(index).tsx",
            Page::new(|_| Ok(Node::text("static-ish")))
                .with_loader(move |_ctx| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok(json!(null)) }
                })
                .revalidate(0),
        )
        .build()
        .unwrap();

    app.handle(Request::new(Method::Get, "/")).await;
    tokio::time::advance(Duration::from_secs(3600)).await;
    let later = app.handle(Request::new(Method::Get, "/")).await;
    assert_eq!(cache(&later), "HIT");
    settle().await;
    assert_eq!(loads.load(Ordering::SeqCst), 1);
}

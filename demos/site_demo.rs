//! Demo site served from `demos/site`.
//!
//! ```text
//! cargo run --example site_demo            # production server on :5173
//! cargo run --example site_demo -- dev     # dev server with file watching and HMR
//! cargo run --example site_demo -- export  # static export into dist/
//! RUST_LOG=islet=debug cargo run --example site_demo
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use islet::app::api::ApiContext;
use islet::app::{App, dev, export};
use islet::config::{AppMode, FrameworkConfig, RenderMode};
use islet::context::LoaderContext;
use islet::http::{Method, StatusCode};
use islet::islands::{IslandDef, Strategy};
use islet::middleware::from_fn;
use islet::middleware::security::SecurityHeaders;
use islet::render::LoaderError;
use islet::render::module::{Page, PageProps};
use islet::render::view::Node;
use islet::server::Server;
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

fn layout(title: &str, body: Node) -> Node {
    Node::fragment([
        Node::element("nav").children([
            Node::element("a").attr("href", "/").child(Node::text("Home")),
            Node::text(" · "),
            Node::element("a").attr("href", "/about").child(Node::text("About")),
            Node::text(" · "),
            Node::element("a").attr("href", "/live").child(Node::text("Live")),
        ]),
        Node::element("h1").child(Node::text(title)),
        body,
    ])
}

fn title_head(title: &'static str) -> impl Fn(&PageProps) -> Node + Send + Sync + 'static {
    move |_: &PageProps| Node::element("title").child(Node::text(title))
}

fn home() -> Page {
    Page::new(|props: &PageProps| {
        let posts = props.data["posts"].as_array().cloned().unwrap_or_default();
        let list = Node::element("ul").children(posts.iter().map(|slug| {
            let slug = slug.as_str().unwrap_or_default();
            Node::element("li").child(
                Node::element("a")
                    .attr("href", format!("/blog/{slug}"))
                    .child(Node::text(slug)),
            )
        }));
        Ok(layout(
            "islet demo",
            Node::fragment([list, Node::island("Counter", json!({ "start": 1 }))]),
        ))
    })
    .with_head(title_head("islet demo"))
    .with_loader(|ctx: LoaderContext| async move {
        let posts = ctx
            .store()
            .list("post:")
            .into_iter()
            .map(|(key, _)| Value::from(key.trim_start_matches("post:")))
            .collect::<Vec<_>>();
        Ok(json!({ "posts": posts }))
    })
    .revalidate(5)
}

fn post() -> Page {
    Page::new(|props: &PageProps| {
        let title = props.data["title"].as_str().unwrap_or("untitled");
        let body = props.data["body"].as_str().unwrap_or_default();
        Ok(layout(title, Node::element("p").child(Node::text(body))))
    })
    .with_loader(|ctx: LoaderContext| async move {
        let slug = ctx.param("slug").unwrap_or_default();
        ctx.store()
            .get(&format!("post:{slug}"))
            .ok_or_else(|| LoaderError::msg(format!("no post named {slug}")))
    })
    .revalidate(30)
}

fn live() -> Page {
    Page::new(|_: &PageProps| {
        Ok(layout(
            "Live",
            Node::dynamic("visitor", Node::text("checking who you are"), |ctx: &LoaderContext| {
                let who = ctx.data().get("visitor").and_then(Value::as_str).unwrap_or("stranger");
                Node::element("p").child(Node::text(format!("Hello, {who}.")))
            }),
        ))
    })
    .with_mode(RenderMode::Ppr)
    .with_middleware(from_fn(|ctx| {
        Box::pin(async move {
            let visitor = ctx.cookies().get("name").cloned().unwrap_or_else(|| "stranger".into());
            ctx.data_mut().insert("visitor".into(), visitor.into());
            ctx.set_header("Cache-Control", "no-store");
            Ok(())
        })
    }))
}

fn build(mode: AppMode) -> Result<App, islet::AppError> {
    let config = FrameworkConfig {
        site_dir: PathBuf::from("demos/site"),
        ..FrameworkConfig::default()
    };

    let app = App::builder(config)
        .mode(mode)
        .middleware(Arc::new(SecurityHeaders::default()))
        .island(IslandDef::new(
            "Counter",
            "components/Counter.js",
            Strategy::Visible,
            |props: &Value| Node::element("button").child(Node::text(props["start"].to_string())),
        ))
        .page("(index).js", home())
        .page(
            "(about).js",
            Page::new(|_: &PageProps| {
                Ok(layout("About", Node::text("Routes, islands and render modes.")))
            })
            .with_head(title_head("About")),
        )
        .page("blog/[slug].js", post())
        .page("(live).js", live())
        .api("posts", |ctx: ApiContext| async move {
            if *ctx.method() != Method::Post {
                return islet::Response::json(StatusCode::Ok, &ctx.store().list("post:"));
            }
            let Some(slug) = ctx.body()["slug"].as_str() else {
                let body = json!({ "error": "slug required" });
                return islet::Response::json(StatusCode::BadRequest, &body);
            };
            ctx.store().set(&format!("post:{slug}"), ctx.body().clone());
            islet::Response::json(StatusCode::Created, &json!({ "created": slug }))
        })
        .build()?;

    app.store().set(
        "post:hello-world",
        json!({ "title": "Hello, world", "body": "The first post." }),
    );
    Ok(app)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("islet=info")),
        )
        .init();

    let command = std::env::args().nth(1).unwrap_or_default();
    let mode = if command == "dev" { AppMode::Dev } else { AppMode::Prod };
    let app = build(mode)?;

    if command == "export" {
        let report = export::export(&app).await?;
        println!("exported {} pages and {} assets", report.pages.len(), report.assets);
        return Ok(());
    }

    let _watcher = if mode.is_dev() { Some(dev::watch(&app)?) } else { None };
    let server = Server::bind(app.config().server.address()).await?;
    println!("listening on http://{}", server.local_addr());
    server.serve(app).await?;
    Ok(())
}

//! Small HTTP server showing request context flowing through timers and tasks.
//!
//! ```text
//! curl localhost:3000/profile          # sync + timer writes, read back
//! curl localhost:3000/context          # whole root object
//! curl -i localhost:3000/explode       # panic before headers: Connection: close
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::get};
use clap::Parser;
use request_context::{ContextConfig, get_context, set, set_context, tracker};
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "request-context-demo", about = "Request context demo server")]
struct Args {
    /// Address to bind to.
    #[arg(long, env = "DEMO_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on.
    #[arg(long, env = "DEMO_PORT", default_value_t = 3000)]
    port: u16,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    init_tracing(args.json_logs);

    let config = ContextConfig::from_env()?;
    let app = router(config);

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Demo server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Demo server shutting down");
        })
        .await?;

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("request_context=info,request_context_demo=info,tower_http=info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn router(config: ContextConfig) -> Router {
    Router::new()
        .route("/profile", get(profile_handler))
        .route("/context", get(context_handler))
        .route("/explode", get(explode_handler))
        .layer(request_context::middleware("request").with_config(config.clone()))
        .layer(request_context::middleware("user").with_config(config))
        .layer(TraceLayer::new_for_http())
}

async fn profile_handler() -> Result<Json<Value>, StatusCode> {
    set("user:name", json!({ "first": "Ann" })).map_err(internal)?;

    tracker::delay(Duration::from_millis(10), async {
        if let Err(e) = set_context("user:async.ready", true) {
            tracing::warn!("Timer continuation could not write context: {}", e);
        }
    })
    .await
    .map_err(internal)?;

    let user = request_context::get(Some("user")).unwrap_or(Value::Null);
    Ok(Json(user))
}

async fn context_handler() -> Result<Json<Value>, StatusCode> {
    set_context("request:handler", "context").map_err(internal)?;
    tracker::spawn_blocking(|| set_context("request:blocking.checked", true))
        .await
        .map_err(internal)?
        .map_err(internal)?;

    let root = request_context::get(None).unwrap_or(Value::Null);
    let handler = get_context("request:handler");
    tracing::info!(?handler, "Served whole context");
    Ok(Json(root))
}

async fn explode_handler() -> impl IntoResponse {
    tracker::spawn(fail_in_background())
        .await
        .map(|_| StatusCode::OK)
        .unwrap_or(StatusCode::BAD_GATEWAY)
}

async fn fail_in_background() {
    panic!("continuation failed before the response was ready")
}

fn internal(e: impl std::fmt::Display) -> StatusCode {
    tracing::error!("Request failed: {}", e);
    StatusCode::INTERNAL_SERVER_ERROR
}

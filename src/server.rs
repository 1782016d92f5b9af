//! Liveness endpoint served next to the worker loop.

use axum::routing::get;
use axum::Router;

async fn healthz() -> &'static str {
    "ok"
}

pub async fn serve(port: u16) -> std::io::Result<()> {
    let app = Router::new().route("/healthz", get(healthz));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app).await
}

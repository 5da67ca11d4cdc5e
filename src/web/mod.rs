//! Read API server.
//!
//! A small axum surface over the storage writer, mounted under
//! `/exporters`. Served only when the web exporter is enabled in
//! config.

mod aggregate;
mod handlers;

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::storage::StorageWriter;

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn StorageWriter>,
}

pub struct Server {
    state: AppState,
    port: u16,
}

impl Server {
    pub fn new(storage: Arc<dyn StorageWriter>, port: u16) -> Self {
        Self {
            state: AppState { storage },
            port,
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .nest(
                "/exporters",
                Router::new()
                    .route("/uptime", get(handlers::handle_uptime))
                    .route("/tlscert", get(handlers::handle_tlscert)),
            )
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Serve until `ctx` is cancelled. In-flight requests get a
    /// one-second drain window before the server is dropped.
    pub async fn run(self, ctx: CancellationToken) -> std::io::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;

        tracing::info!(addr = %addr, "starting api server");

        let shutdown = ctx.clone();
        let serve = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .into_future();
        tokio::pin!(serve);

        let drain = async {
            ctx.cancelled().await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        };

        tokio::select! {
            result = &mut serve => result,
            _ = drain => Ok(()),
        }
    }
}

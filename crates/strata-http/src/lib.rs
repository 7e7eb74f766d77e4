//! HTTP surface of a Strata object server.
//!
//! Provides a [`StrataServer`] exposing an axum router over one
//! [`StorageEngine`]. Peer routes:
//!
//! - `PUT|GET|HEAD|POST|DELETE /shard/{device}/{hash}/{index}`: stable shards
//! - `GET /partition/{device}/{partition}`: index rows as JSON
//! - `PUT /nursery/{device}/{hash}`: nursery copy or tombstone
//! - `POST /nursery/{device}/{hash}/{metahash}/{timestamp}`: stabilized elsewhere
//! - `PUT /reconstruct/{device}/{account}/{container}/{*obj}`: rebuild a shard
//! - `POST /priorityrep`: run one priority replication job
//!
//! Client routes, `/{device}/{partition}/{account}/{container}/{*obj}`:
//! PUT writes a nursery object, GET reads it (one `Range` at most), HEAD
//! returns its headers, POST updates metadata and DELETE writes a tombstone.

mod error;
mod handlers;


use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post, put};
use strata_engine::StorageEngine;

pub use error::ApiError;

/// Largest object a client may PUT: 5 GiB.
pub const DEFAULT_MAX_BODY_BYTES: u64 = 5 * 1024 * 1024 * 1024;

/// Shared state for all handlers.
#[derive(Clone)]
pub(crate) struct AppState {
    pub engine: StorageEngine,
    pub max_body_bytes: u64,
}

/// Configuration for creating a [`StrataServer`].
pub struct StrataServerConfig {
    /// The engine serving this server's devices.
    pub engine: StorageEngine,
    /// Largest accepted request body. Object and shard bodies are streamed
    /// to disk, so this bounds disk use per request, not memory.
    pub max_body_bytes: u64,
}

impl StrataServerConfig {
    pub fn new(engine: StorageEngine) -> Self {
        Self {
            engine,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// Object server HTTP API backed by a [`StorageEngine`].
pub struct StrataServer {
    router: Router,
}

impl StrataServer {
    pub fn new(config: StrataServerConfig) -> Self {
        let state = AppState {
            engine: config.engine,
            max_body_bytes: config.max_body_bytes,
        };
        // Only buffered extractors honor this; streamed bodies are checked
        // against `max_body_bytes` as they arrive.
        let buffered_limit = usize::try_from(config.max_body_bytes).unwrap_or(usize::MAX);
        let router = Self::build_router(state, buffered_limit);
        Self { router }
    }

    fn build_router(state: AppState, max_body_bytes: usize) -> Router {
        Router::new()
            .route("/healthcheck", get(handlers::healthcheck))
            .route(
                "/shard/{device}/{hash}/{index}",
                put(handlers::put_shard)
                    .get(handlers::get_shard)
                    .head(handlers::head_shard)
                    .post(handlers::post_shard)
                    .delete(handlers::delete_shard),
            )
            .route(
                "/partition/{device}/{partition}",
                get(handlers::list_partition),
            )
            .route("/nursery/{device}/{hash}", put(handlers::put_nursery))
            .route(
                "/nursery/{device}/{hash}/{metahash}/{timestamp}",
                post(handlers::post_nursery),
            )
            .route(
                "/reconstruct/{device}/{account}/{container}/{*obj}",
                put(handlers::reconstruct),
            )
            .route("/priorityrep", post(handlers::priority_rep))
            .route(
                "/{device}/{partition}/{account}/{container}/{*obj}",
                put(handlers::put_object)
                    .get(handlers::get_object)
                    .head(handlers::head_object)
                    .post(handlers::post_object)
                    .delete(handlers::delete_object),
            )
            .layer(DefaultBodyLimit::max(max_body_bytes))
            .with_state(state)
    }

    /// Return the inner [`Router`] (useful for testing with `tower::ServiceExt`).
    pub fn into_router(self) -> Router {
        self.router
    }

    /// Serve on the given TCP address.
    pub async fn serve(self, addr: &str) -> Result<(), std::io::Error> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(addr, "object server listening");
        axum::serve(listener, self.router).await
    }

    /// Serve until `shutdown` completes, then drain in-flight requests.
    pub async fn serve_with_shutdown(
        self,
        addr: &str,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), std::io::Error> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(addr, "object server listening");
        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
    }
}

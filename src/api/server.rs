//! HTTP server setup: router, admin auth middleware, and route wiring.

use super::error::ApiError;
use super::state::ApiState;
use super::{bots, context, system, tasks};

use axum::Router;
use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use subtle::ConstantTimeEq as _;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};

use std::net::SocketAddr;
use std::sync::Arc;

/// Start the admin HTTP server on the given address.
pub async fn start_admin_server(
    bind: SocketAddr,
    state: Arc<ApiState>,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let v1 = Router::new()
        .route("/status", get(system::status))
        .route("/bots", post(bots::create_bot).get(bots::list_bots))
        .route(
            "/bots/{bot_id}",
            get(bots::get_bot).put(bots::update_bot).delete(bots::delete_bot),
        )
        .route("/bots/{bot_id}/instances", get(bots::list_instances))
        .route(
            "/bots/{bot_id}/instances/{instance_id}",
            delete(bots::close_instance),
        )
        .route("/bots/{bot_id}/actions/{command_name}", post(tasks::submit_action))
        .route("/bots/{bot_id}/commands/{command_name}", post(bots::invoke_command))
        .route("/tasks/{task_id}", get(tasks::get_task).delete(tasks::cancel_task))
        .route(
            "/context/{session_id}/{namespace}",
            post(context::upsert_context)
                .get(context::get_context)
                .delete(context::delete_context),
        )
        .layer(middleware::from_fn_with_state(state.clone(), require_admin));

    let app = Router::new()
        .route("/health", get(system::health))
        .nest("/v1", v1)
        .layer(cors)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(address = %bind, "admin API listening");

    let handle = tokio::spawn(async move {
        let mut shutdown = shutdown_rx;
        if let Err(error) = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await
        {
            tracing::error!(%error, "admin API exited with error");
        }
    });

    Ok(handle)
}

/// Bearer-token check for everything under `/v1/`. Comparison is
/// constant-time, same as the data-plane credentials.
async fn require_admin(
    State(state): State<Arc<ApiState>>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| {
            bool::from(
                token
                    .as_bytes()
                    .ct_eq(state.core.config.admin_token.as_bytes()),
            )
        });

    if !authorized {
        return ApiError::unauthorized().into_response();
    }
    next.run(request).await
}

// cagg - bitdrift's cluster metrics aggregator
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


use crate::status::Status;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bd_log::SwapLogger;
use bd_server_stats::stats::Collector;
use bd_shutdown::ComponentShutdown;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;

//
// AdminState
//

// Operator facing HTTP surface: health, status, internal stats and runtime log control.
pub struct AdminState {
  collector: Collector,
  status: Status,
}

impl AdminState {
  #[must_use]
  pub fn new(collector: Collector, status: Status) -> Arc<Self> {
    Arc::new(Self { collector, status })
  }

  #[allow(clippy::unused_async)]
  async fn root() -> String {
    "cagg admin server".to_string()
  }

  #[allow(clippy::unused_async)]
  async fn healthcheck(State(state): State<Arc<Self>>) -> Response {
    if state.status.health() {
      (StatusCode::OK, "OK").into_response()
    } else {
      (StatusCode::SERVICE_UNAVAILABLE, "DOWN").into_response()
    }
  }

  async fn status(State(state): State<Arc<Self>>) -> Response {
    Json(state.status.status().await).into_response()
  }

  #[allow(clippy::unused_async)]
  async fn metrics(State(state): State<Arc<Self>>) -> Response {
    (
      [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
      state.collector.prometheus_output(),
    )
      .into_response()
  }

  #[allow(clippy::unused_async)]
  async fn log_filter(Query(mut params): Query<HashMap<String, String>>) -> String {
    let Some(filter) = params.remove("filter") else {
      return "usage: /log_filter?filter=RUST_LOG".to_string();
    };
    log::info!("updating log filter: {filter}");
    if let Err(e) = SwapLogger::swap(&filter) {
      log::warn!("error updating log filter: {e}");
    }

    "OK".to_string()
  }

  fn make_router(self: Arc<Self>) -> Router {
    Router::new()
      .route("/", get(Self::root))
      .route("/healthcheck", get(Self::healthcheck))
      .route("/status", get(Self::status))
      .route("/metrics", get(Self::metrics))
      .route("/log_filter", post(Self::log_filter))
      .with_state(self)
  }

  pub async fn spawn_server(
    self: Arc<Self>,
    listener: TcpListener,
    mut shutdown: ComponentShutdown,
  ) -> anyhow::Result<()> {
    let router = self.make_router();
    log::info!("admin server starting on: {}", listener.local_addr()?);
    axum::serve(listener, router)
      .with_graceful_shutdown(async move { shutdown.cancelled().await })
      .await?;
    log::info!("admin server stopped");
    Ok(())
  }
}

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{Router, extract::State as AxumState, response::Json, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::client::ClusterClient;
use crate::controller::{Context, KindCounters};

#[derive(Serialize)]
struct HealthCheck {
    message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorState {
    pub active_config: Option<String>,
    pub last_event: Option<DateTime<Utc>>,
    pub kinds: BTreeMap<String, KindCounters>,
    pub cached_decryptors: usize,
}

pub fn new_router<C: ClusterClient>(ctx: Arc<Context<C>>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/state", get(state::<C>))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

async fn healthz() -> Json<HealthCheck> {
    Json(HealthCheck {
        message: "ok".into(),
    })
}

async fn state<C: ClusterClient>(AxumState(ctx): AxumState<Arc<Context<C>>>) -> Json<OperatorState> {
    let diagnostics = ctx.diagnostics.read().await.clone();
    Json(OperatorState {
        active_config: ctx.active_config.last_active().await,
        last_event: diagnostics.last_event,
        kinds: diagnostics.kinds,
        cached_decryptors: ctx.decryptors.cached_projects().await,
    })
}

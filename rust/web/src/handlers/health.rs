use serde::Serialize;
use warp::reply::Json;

use crate::metrics::MetricsSnapshot;
use crate::server::AppContext;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthBody {
    status: &'static str,
    active_games: usize,
    metrics: MetricsSnapshot,
}

pub fn health(ctx: &AppContext) -> Json {
    warp::reply::json(&HealthBody {
        status: "ok",
        active_games: ctx.store().session_count(),
        metrics: ctx.metrics().snapshot(),
    })
}

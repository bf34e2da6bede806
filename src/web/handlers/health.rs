use std::sync::Arc;

use salvo::prelude::*;
use serde_json::json;

use crate::web::WebState;

#[handler]
pub async fn health_check(depot: &mut Depot, res: &mut Response) {
    let uptime_seconds = depot
        .obtain::<Arc<WebState>>()
        .map(|state| state.started_at.elapsed().as_secs())
        .unwrap_or_default();

    res.render(Json(json!({
        "status": "ok",
        "uptime_seconds": uptime_seconds,
        "version": env!("CARGO_PKG_VERSION"),
    })));
}

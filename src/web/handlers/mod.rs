use std::future::Future;
use std::sync::Arc;

use salvo::prelude::*;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::app::reply_for_error;
use crate::lifecycle::{ErrorKind, GENERIC_FAILURE_MESSAGE, LifecycleError};
use crate::web::WebState;
use crate::web::middleware::auth::ACTOR_KEY;

pub mod health;
pub mod roles;
pub mod tickets;

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Authorization => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn render_error(res: &mut Response, err: &LifecycleError) {
    res.status_code(status_for(err.kind()));
    res.render(Json(json!({ "error": reply_for_error(err) })));
}

/// Body that may be omitted entirely.
pub(crate) async fn optional_body<T>(req: &mut Request) -> Result<T, LifecycleError>
where
    T: DeserializeOwned + Default,
{
    let payload = req
        .payload()
        .await
        .map_err(|e| LifecycleError::Validation(format!("unreadable body: {e}")))?;
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(payload)
        .map_err(|e| LifecycleError::Validation(format!("invalid body: {e}")))
}

pub(crate) async fn required_body<T>(req: &mut Request) -> Result<T, LifecycleError>
where
    T: DeserializeOwned,
{
    let payload = req
        .payload()
        .await
        .map_err(|e| LifecycleError::Validation(format!("unreadable body: {e}")))?;
    serde_json::from_slice(payload)
        .map_err(|e| LifecycleError::Validation(format!("invalid body: {e}")))
}

/// Runs `work` with the shared state and the authenticated actor id, then
/// renders its result.
pub(crate) async fn respond<F, Fut>(depot: &Depot, res: &mut Response, work: F)
where
    F: FnOnce(Arc<WebState>, String) -> Fut,
    Fut: Future<Output = Result<Value, LifecycleError>>,
{
    let state = depot.obtain::<Arc<WebState>>().ok().cloned();
    let actor_id = depot.get::<String>(ACTOR_KEY).ok().cloned();
    let (Some(state), Some(actor_id)) = (state, actor_id) else {
        res.status_code(StatusCode::INTERNAL_SERVER_ERROR);
        res.render(Json(json!({ "error": GENERIC_FAILURE_MESSAGE })));
        return;
    };

    match work(state, actor_id).await {
        Ok(body) => res.render(Json(body)),
        Err(err) => render_error(res, &err),
    }
}


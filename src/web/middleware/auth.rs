use std::sync::Arc;

use salvo::affix_state;
use salvo::prelude::*;
use secrecy::ExposeSecret;
use serde_json::json;

use crate::web::WebState;
use crate::web::handlers::{
    health::health_check,
    roles::{assign_role, create_role, delete_role, list_roles, revoke_role, update_role},
    tickets::{
        add_participant, claim_ticket, close_ticket, create_ticket, get_ticket,
        get_ticket_transcript, list_ticket_events, remove_participant, set_autoclose,
        submit_feedback, transfer_ticket, unclaim_ticket,
    },
};

/// Header carrying the acting Discord user id.
pub const ACTOR_HEADER: &str = "x-actor-id";
/// Depot key holding the acting user id once the request is authenticated.
pub const ACTOR_KEY: &str = "actor_id";

fn reject(res: &mut Response, ctrl: &mut FlowCtrl, status: StatusCode, message: &str) {
    res.status_code(status);
    res.render(Json(json!({ "error": message })));
    ctrl.skip_rest();
}

fn bearer(req: &Request) -> Option<String> {
    req.header::<String>("authorization")?
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
}

/// Checks the API token and records the actor id for the handlers.
#[handler]
pub async fn require_api_token(
    req: &mut Request,
    depot: &mut Depot,
    res: &mut Response,
    ctrl: &mut FlowCtrl,
) {
    let Ok(state) = depot.obtain::<Arc<WebState>>() else {
        reject(res, ctrl, StatusCode::INTERNAL_SERVER_ERROR, "web state missing");
        return;
    };
    let Some(expected) = state.api_token.as_ref() else {
        reject(res, ctrl, StatusCode::UNAUTHORIZED, "api access is disabled");
        return;
    };
    match bearer(req) {
        Some(token) if token == expected.expose_secret() => {}
        _ => {
            reject(res, ctrl, StatusCode::UNAUTHORIZED, "invalid api token");
            return;
        }
    }

    let actor = req
        .header::<String>(ACTOR_HEADER)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    let Some(actor) = actor else {
        reject(res, ctrl, StatusCode::BAD_REQUEST, "missing X-Actor-Id header");
        return;
    };
    depot.insert(ACTOR_KEY, actor);
}

pub fn create_router(state: Arc<WebState>) -> Router {
    Router::new()
        .hoop(affix_state::inject(state))
        .push(Router::with_path("health").get(health_check))
        .push(
            Router::with_path("api")
                .hoop(require_api_token)
                .push(Router::with_path("guilds/{guild_id}/tickets").post(create_ticket))
                .push(
                    Router::with_path("guilds/{guild_id}/roles")
                        .get(list_roles)
                        .post(create_role)
                        .push(
                            Router::with_path("{role_id}")
                                .put(update_role)
                                .delete(delete_role)
                                .push(
                                    Router::with_path("members/{user_id}")
                                        .put(assign_role)
                                        .delete(revoke_role),
                                ),
                        ),
                )
                .push(
                    Router::with_path("tickets/{id}")
                        .get(get_ticket)
                        .push(Router::with_path("events").get(list_ticket_events))
                        .push(Router::with_path("transcript").get(get_ticket_transcript))
                        .push(Router::with_path("claim").post(claim_ticket))
                        .push(Router::with_path("unclaim").post(unclaim_ticket))
                        .push(Router::with_path("close").post(close_ticket))
                        .push(Router::with_path("transfer").post(transfer_ticket))
                        .push(Router::with_path("autoclose").post(set_autoclose))
                        .push(Router::with_path("participants").post(add_participant))
                        .push(
                            Router::with_path("participants/{user_id}").delete(remove_participant),
                        )
                        .push(Router::with_path("feedback").post(submit_feedback)),
                ),
        )
}

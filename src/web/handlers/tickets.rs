use salvo::prelude::*;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::lifecycle::{CloseOptions, LifecycleError, NewTicketRequest, TicketOutcome};

use super::{optional_body, required_body, respond};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CreateTicketBody {
    subject: Option<String>,
    panel_id: Option<String>,
    metadata: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ReasonBody {
    reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CloseBody {
    reason: Option<String>,
    delete_channel: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct TransferBody {
    to_user_id: String,
    #[serde(default)]
    from_user_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AutocloseBody {
    excluded: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ParticipantBody {
    user_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct FeedbackBody {
    rating: i32,
    #[serde(default)]
    comment: Option<String>,
}

fn outcome_json(outcome: &TicketOutcome) -> Value {
    json!({
        "ticket": outcome.ticket,
        "changed": outcome.changed,
        "notices": outcome.notices,
    })
}

fn ticket_id(req: &Request) -> Result<i64, LifecycleError> {
    req.param::<i64>("id")
        .ok_or_else(|| LifecycleError::Validation("ticket id must be a number".to_string()))
}

#[handler]
pub async fn create_ticket(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let guild_id = req.param::<String>("guild_id").unwrap_or_default();
    let body = optional_body::<CreateTicketBody>(req).await;
    res.status_code(StatusCode::CREATED);
    respond(depot, res, |state, actor_id| async move {
        let body = body?;
        let actor = state.app.actor(&guild_id, &actor_id, &[]).await?;
        let outcome = state
            .app
            .tickets()
            .create(
                &actor,
                NewTicketRequest {
                    guild_id,
                    opener_id: actor_id,
                    subject: body.subject,
                    panel_id: body.panel_id,
                    metadata: body.metadata,
                },
            )
            .await?;
        Ok(outcome_json(&outcome))
    })
    .await;
}

#[handler]
pub async fn get_ticket(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let id = ticket_id(req);
    respond(depot, res, |state, actor_id| async move {
        let id = id?;
        let (actor, _) = state.actor_for_ticket(id, &actor_id).await?;
        let ticket = state.app.tickets().get_ticket(&actor, id).await?;
        Ok(json!({ "ticket": ticket }))
    })
    .await;
}

#[handler]
pub async fn list_ticket_events(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let id = ticket_id(req);
    respond(depot, res, |state, actor_id| async move {
        let id = id?;
        let (actor, _) = state.actor_for_ticket(id, &actor_id).await?;
        let events = state.app.tickets().list_events(&actor, id).await?;
        Ok(json!({ "events": events }))
    })
    .await;
}

#[handler]
pub async fn get_ticket_transcript(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let id = ticket_id(req);
    respond(depot, res, |state, actor_id| async move {
        let id = id?;
        let (actor, _) = state.actor_for_ticket(id, &actor_id).await?;
        state.app.tickets().get_ticket(&actor, id).await?;
        let messages = state.app.transcripts().messages(id).await?;
        Ok(json!({ "messages": messages }))
    })
    .await;
}

#[handler]
pub async fn claim_ticket(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let id = ticket_id(req);
    respond(depot, res, |state, actor_id| async move {
        let id = id?;
        let (actor, _) = state.actor_for_ticket(id, &actor_id).await?;
        let outcome = state.app.tickets().claim(&actor, id).await?;
        Ok(outcome_json(&outcome))
    })
    .await;
}

#[handler]
pub async fn unclaim_ticket(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let id = ticket_id(req);
    let body = optional_body::<ReasonBody>(req).await;
    respond(depot, res, |state, actor_id| async move {
        let (id, body) = (id?, body?);
        let (actor, _) = state.actor_for_ticket(id, &actor_id).await?;
        let outcome = state.app.tickets().unclaim(&actor, id, body.reason).await?;
        Ok(outcome_json(&outcome))
    })
    .await;
}

#[handler]
pub async fn close_ticket(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let id = ticket_id(req);
    let body = optional_body::<CloseBody>(req).await;
    respond(depot, res, |state, actor_id| async move {
        let (id, body) = (id?, body?);
        let (actor, _) = state.actor_for_ticket(id, &actor_id).await?;
        let options = CloseOptions {
            delete_channel: body.delete_channel.unwrap_or(true),
            ..CloseOptions::default()
        };
        let outcome = state.app.tickets().close(&actor, id, body.reason, options).await?;
        Ok(outcome_json(&outcome))
    })
    .await;
}

#[handler]
pub async fn transfer_ticket(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let id = ticket_id(req);
    let body = required_body::<TransferBody>(req).await;
    respond(depot, res, |state, actor_id| async move {
        let (id, body) = (id?, body?);
        let (actor, ticket) = state.actor_for_ticket(id, &actor_id).await?;
        let from = body
            .from_user_id
            .or(ticket.claimed_by_id)
            .ok_or(LifecycleError::NotClaimed)?;
        let outcome = state
            .app
            .tickets()
            .transfer(&actor, id, &from, &body.to_user_id)
            .await?;
        Ok(outcome_json(&outcome))
    })
    .await;
}

#[handler]
pub async fn set_autoclose(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let id = ticket_id(req);
    let body = required_body::<AutocloseBody>(req).await;
    respond(depot, res, |state, actor_id| async move {
        let (id, body) = (id?, body?);
        let (actor, _) = state.actor_for_ticket(id, &actor_id).await?;
        let outcome = state
            .app
            .tickets()
            .set_autoclose_excluded(&actor, id, body.excluded)
            .await?;
        Ok(outcome_json(&outcome))
    })
    .await;
}

#[handler]
pub async fn add_participant(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let id = ticket_id(req);
    let body = required_body::<ParticipantBody>(req).await;
    respond(depot, res, |state, actor_id| async move {
        let (id, body) = (id?, body?);
        let (actor, _) = state.actor_for_ticket(id, &actor_id).await?;
        let outcome = state
            .app
            .tickets()
            .add_participant(&actor, id, &body.user_id)
            .await?;
        Ok(outcome_json(&outcome))
    })
    .await;
}

#[handler]
pub async fn remove_participant(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let id = ticket_id(req);
    let user_id = req.param::<String>("user_id").unwrap_or_default();
    respond(depot, res, |state, actor_id| async move {
        let id = id?;
        let (actor, _) = state.actor_for_ticket(id, &actor_id).await?;
        let outcome = state
            .app
            .tickets()
            .remove_participant(&actor, id, &user_id)
            .await?;
        Ok(outcome_json(&outcome))
    })
    .await;
}

#[handler]
pub async fn submit_feedback(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let id = ticket_id(req);
    let body = required_body::<FeedbackBody>(req).await;
    respond(depot, res, |state, actor_id| async move {
        let (id, body) = (id?, body?);
        let (actor, _) = state.actor_for_ticket(id, &actor_id).await?;
        let outcome = state
            .app
            .tickets()
            .submit_feedback(&actor, id, body.rating, body.comment)
            .await?;
        Ok(outcome_json(&outcome))
    })
    .await;
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use std::sync::Arc;

    use salvo::test::{ResponseExt, TestClient};
    use serde_json::json;

    use super::*;
    use crate::app::TicketApp;
    use crate::config::Config;
    use crate::db::test_helpers::sqlite_manager;
    use crate::events::EventBus;
    use crate::testing::FakeProvider;
    use crate::web::WebServer;

    const BASE: &str = "http://127.0.0.1:9010";

    async fn service() -> (tempfile::NamedTempFile, Service) {
        let (file, db) = sqlite_manager().await;
        let config = Config::from_yaml(
            "discord:\n  bot_token: test-token\ndatabase:\n  filename: unused.db\nweb:\n  api_token: secret\n",
        )
        .expect("config");
        let app = TicketApp::new(db, Arc::new(FakeProvider::new()), EventBus::default(), &config);
        app.on_guild_available("g1", "owner").await.expect("bootstrap");
        let server = WebServer::new(&config.web, Arc::new(app));
        (file, Service::new(server.router()))
    }

    async fn open_ticket(service: &Service) -> i64 {
        let mut res = TestClient::post(format!("{BASE}/api/guilds/g1/tickets"))
            .add_header("authorization", "Bearer secret", true)
            .add_header("x-actor-id", "opener", true)
            .json(&json!({ "subject": "refund" }))
            .send(service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::CREATED));
        let body: Value = res.take_json().await.expect("json");
        body["ticket"]["id"].as_i64().expect("ticket id")
    }

    #[tokio::test]
    async fn health_needs_no_token() {
        let (_file, service) = service().await;
        let mut res = TestClient::get(format!("{BASE}/health")).send(&service).await;
        assert_eq!(res.status_code, Some(StatusCode::OK));
        let body: Value = res.take_json().await.expect("json");
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn api_rejects_missing_token_and_actor() {
        let (_file, service) = service().await;
        let res = TestClient::get(format!("{BASE}/api/tickets/1")).send(&service).await;
        assert_eq!(res.status_code, Some(StatusCode::UNAUTHORIZED));

        let res = TestClient::get(format!("{BASE}/api/tickets/1"))
            .add_header("authorization", "Bearer secret", true)
            .send(&service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::BAD_REQUEST));
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let (_file, service) = service().await;
        let id = open_ticket(&service).await;

        let res = TestClient::get(format!("{BASE}/api/tickets/{id}"))
            .add_header("authorization", "Bearer secret", true)
            .add_header("x-actor-id", "stranger", true)
            .send(&service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::FORBIDDEN));

        let res = TestClient::get(format!("{BASE}/api/tickets/9999"))
            .add_header("authorization", "Bearer secret", true)
            .add_header("x-actor-id", "owner", true)
            .send(&service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::NOT_FOUND));

        let res = TestClient::post(format!("{BASE}/api/tickets/{id}/claim"))
            .add_header("authorization", "Bearer secret", true)
            .add_header("x-actor-id", "owner", true)
            .send(&service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::OK));

        let mut res = TestClient::post(format!("{BASE}/api/tickets/{id}/claim"))
            .add_header("authorization", "Bearer secret", true)
            .add_header("x-actor-id", "owner", true)
            .send(&service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::OK));
        let body: Value = res.take_json().await.expect("json");
        assert_eq!(body["changed"], false);

        let res = TestClient::post(format!("{BASE}/api/tickets/{id}/transfer"))
            .add_header("authorization", "Bearer secret", true)
            .add_header("x-actor-id", "owner", true)
            .json(&json!({ "to_user_id": "owner" }))
            .send(&service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::BAD_REQUEST));

        let res = TestClient::post(format!("{BASE}/api/tickets/{id}/close"))
            .add_header("authorization", "Bearer secret", true)
            .add_header("x-actor-id", "owner", true)
            .send(&service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::OK));

        let res = TestClient::post(format!("{BASE}/api/tickets/{id}/claim"))
            .add_header("authorization", "Bearer secret", true)
            .add_header("x-actor-id", "owner", true)
            .send(&service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::CONFLICT));

        let res = TestClient::post(format!("{BASE}/api/tickets/{id}/feedback"))
            .add_header("authorization", "Bearer secret", true)
            .add_header("x-actor-id", "opener", true)
            .json(&json!({ "rating": 9 }))
            .send(&service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::BAD_REQUEST));
    }

    #[tokio::test]
    async fn close_returns_the_closed_ticket() {
        let (_file, service) = service().await;
        let id = open_ticket(&service).await;

        let mut res = TestClient::post(format!("{BASE}/api/tickets/{id}/close"))
            .add_header("authorization", "Bearer secret", true)
            .add_header("x-actor-id", "owner", true)
            .json(&json!({ "reason": "done" }))
            .send(&service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::OK));
        let body: Value = res.take_json().await.expect("json");
        assert_eq!(body["changed"], true);
        assert_eq!(body["ticket"]["status"], "CLOSED");

        let mut res = TestClient::get(format!("{BASE}/api/tickets/{id}/events"))
            .add_header("authorization", "Bearer secret", true)
            .add_header("x-actor-id", "owner", true)
            .send(&service)
            .await;
        let body: Value = res.take_json().await.expect("json");
        let actions: Vec<&str> = body["events"]
            .as_array()
            .expect("events")
            .iter()
            .filter_map(|event| event["action"].as_str())
            .collect();
        assert!(actions.contains(&"closed"), "{actions:?}");
    }

    #[tokio::test]
    async fn transcript_is_visible_to_the_opener_only() {
        let (_file, service) = service().await;
        let id = open_ticket(&service).await;

        let mut res = TestClient::get(format!("{BASE}/api/tickets/{id}/transcript"))
            .add_header("authorization", "Bearer secret", true)
            .add_header("x-actor-id", "opener", true)
            .send(&service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::OK));
        let body: Value = res.take_json().await.expect("json");
        assert_eq!(body["messages"].as_array().map(Vec::len), Some(0));

        let res = TestClient::get(format!("{BASE}/api/tickets/{id}/transcript"))
            .add_header("authorization", "Bearer secret", true)
            .add_header("x-actor-id", "stranger", true)
            .send(&service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::FORBIDDEN));
    }
}

use salvo::prelude::*;
use serde::Deserialize;
use serde_json::json;

use crate::lifecycle::LifecycleError;
use crate::permissions::PermissionFlags;

use super::{required_body, respond};

#[derive(Debug, Deserialize)]
struct CreateRoleBody {
    name: String,
    permissions: u64,
    #[serde(default)]
    discord_role_id: Option<String>,
    #[serde(default)]
    position: i32,
}

#[derive(Debug, Deserialize)]
struct PermissionsBody {
    permissions: u64,
}

fn guild_id(req: &Request) -> String {
    req.param::<String>("guild_id").unwrap_or_default()
}

fn role_id(req: &Request) -> Result<i64, LifecycleError> {
    req.param::<i64>("role_id")
        .ok_or_else(|| LifecycleError::Validation("role id must be a number".to_string()))
}

#[handler]
pub async fn list_roles(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let guild_id = guild_id(req);
    respond(depot, res, |state, actor_id| async move {
        let actor = state.app.actor(&guild_id, &actor_id, &[]).await?;
        let roles = state.app.roles().list_roles(&actor, &guild_id).await?;
        Ok(json!({ "roles": roles }))
    })
    .await;
}

#[handler]
pub async fn create_role(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let guild_id = guild_id(req);
    let body = required_body::<CreateRoleBody>(req).await;
    res.status_code(StatusCode::CREATED);
    respond(depot, res, |state, actor_id| async move {
        let body = body?;
        let actor = state.app.actor(&guild_id, &actor_id, &[]).await?;
        let role = state
            .app
            .roles()
            .create_role(
                &actor,
                &guild_id,
                &body.name,
                PermissionFlags::from_stored(body.permissions),
                body.discord_role_id.as_deref(),
                body.position,
            )
            .await?;
        Ok(json!({ "role": role }))
    })
    .await;
}

#[handler]
pub async fn update_role(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let guild_id = guild_id(req);
    let role_id = role_id(req);
    let body = required_body::<PermissionsBody>(req).await;
    respond(depot, res, |state, actor_id| async move {
        let (role_id, body) = (role_id?, body?);
        let actor = state.app.actor(&guild_id, &actor_id, &[]).await?;
        let role = state
            .app
            .roles()
            .update_role_permissions(
                &actor,
                &guild_id,
                role_id,
                PermissionFlags::from_stored(body.permissions),
            )
            .await?;
        Ok(json!({ "role": role }))
    })
    .await;
}

#[handler]
pub async fn delete_role(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let guild_id = guild_id(req);
    let role_id = role_id(req);
    respond(depot, res, |state, actor_id| async move {
        let role_id = role_id?;
        let actor = state.app.actor(&guild_id, &actor_id, &[]).await?;
        state.app.roles().delete_role(&actor, &guild_id, role_id).await?;
        Ok(json!({ "deleted": true }))
    })
    .await;
}

#[handler]
pub async fn assign_role(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let guild_id = guild_id(req);
    let role_id = role_id(req);
    let user_id = req.param::<String>("user_id").unwrap_or_default();
    respond(depot, res, |state, actor_id| async move {
        let role_id = role_id?;
        let actor = state.app.actor(&guild_id, &actor_id, &[]).await?;
        let changed = state
            .app
            .roles()
            .assign_role(&actor, &guild_id, role_id, &user_id)
            .await?;
        Ok(json!({ "changed": changed }))
    })
    .await;
}

#[handler]
pub async fn revoke_role(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let guild_id = guild_id(req);
    let role_id = role_id(req);
    let user_id = req.param::<String>("user_id").unwrap_or_default();
    respond(depot, res, |state, actor_id| async move {
        let role_id = role_id?;
        let actor = state.app.actor(&guild_id, &actor_id, &[]).await?;
        let changed = state
            .app
            .roles()
            .revoke_role(&actor, &guild_id, role_id, &user_id)
            .await?;
        Ok(json!({ "changed": changed }))
    })
    .await;
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use std::sync::Arc;

    use salvo::test::{ResponseExt, TestClient};
    use serde_json::{Value, json};

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

    #[tokio::test]
    async fn owner_creates_and_assigns_a_role() {
        let (_file, service) = service().await;

        let mut res = TestClient::post(format!("{BASE}/api/guilds/g1/roles"))
            .add_header("authorization", "Bearer secret", true)
            .add_header("x-actor-id", "owner", true)
            .json(&json!({
                "name": "triage",
                "permissions": PermissionFlags::TICKET_CLAIM.bits(),
            }))
            .send(&service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::CREATED));
        let body: Value = res.take_json().await.expect("json");
        let role_id = body["role"]["id"].as_i64().expect("role id");

        let mut res = TestClient::put(format!("{BASE}/api/guilds/g1/roles/{role_id}/members/agent"))
            .add_header("authorization", "Bearer secret", true)
            .add_header("x-actor-id", "owner", true)
            .send(&service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::OK));
        let body: Value = res.take_json().await.expect("json");
        assert_eq!(body["changed"], true);

        let mut res = TestClient::get(format!("{BASE}/api/guilds/g1/roles"))
            .add_header("authorization", "Bearer secret", true)
            .add_header("x-actor-id", "owner", true)
            .send(&service)
            .await;
        let body: Value = res.take_json().await.expect("json");
        assert_eq!(body["roles"].as_array().map(Vec::len), Some(4));
    }

    #[tokio::test]
    async fn members_without_role_flags_are_forbidden() {
        let (_file, service) = service().await;
        let res = TestClient::post(format!("{BASE}/api/guilds/g1/roles"))
            .add_header("authorization", "Bearer secret", true)
            .add_header("x-actor-id", "stranger", true)
            .json(&json!({ "name": "mine", "permissions": 1 }))
            .send(&service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::FORBIDDEN));
    }
}

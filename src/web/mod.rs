use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use salvo::prelude::*;
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};

use crate::app::TicketApp;
use crate::config::WebConfig;
use crate::db::Ticket;
use crate::lifecycle::LifecycleError;
use crate::permissions::Actor;

pub mod handlers;
pub mod middleware;

use self::middleware::auth::create_router;

/// Shared by every HTTP handler through the depot.
pub struct WebState {
    pub app: Arc<TicketApp>,
    pub api_token: Option<SecretString>,
    pub started_at: Instant,
}

impl WebState {
    pub fn new(app: Arc<TicketApp>, api_token: Option<SecretString>) -> Self {
        Self {
            app,
            api_token,
            started_at: Instant::now(),
        }
    }

    /// Loads the ticket and resolves `user_id` against its guild.
    pub async fn actor_for_ticket(
        &self,
        ticket_id: i64,
        user_id: &str,
    ) -> Result<(Actor, Ticket), LifecycleError> {
        let ticket = self
            .app
            .db()
            .ticket_store()
            .get_ticket(ticket_id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound("ticket".to_string()))?;
        let actor = self.app.actor(&ticket.guild_id, user_id, &[]).await?;
        Ok((actor, ticket))
    }
}

#[derive(Clone)]
pub struct WebServer {
    bind_addr: String,
    state: Arc<WebState>,
}

impl WebServer {
    pub fn new(config: &WebConfig, app: Arc<TicketApp>) -> Self {
        let api_token = config
            .api_token
            .as_ref()
            .map(|token| SecretString::from(token.expose_secret().to_string()));
        if api_token.is_none() {
            warn!("web.api_token is not set; every /api request will be rejected");
        }
        Self {
            bind_addr: format!("{}:{}", config.bind_address, config.port),
            state: Arc::new(WebState::new(app, api_token)),
        }
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    pub async fn start(&self) -> Result<()> {
        info!("starting web server on {}", self.bind_addr);

        let acceptor = TcpListener::new(self.bind_addr.clone()).bind().await;
        Server::new(acceptor).serve(self.router()).await;

        Ok(())
    }
}

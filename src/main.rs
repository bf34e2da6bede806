#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

mod app;
mod cli;
mod config;
mod db;
mod discord;
mod events;
mod lifecycle;
mod permissions;
mod reconcile;
mod transcript;
mod utils;
mod web;

#[cfg(test)]
mod testing;

use app::TicketApp;
use cli::{Cli, Command};
use config::Config;
use discord::DiscordClient;
use events::EventBus;
use permissions::Actor;
use web::WebServer;

#[cfg(feature = "metrics")]
fn install_metrics_exporter(config: &config::MetricsConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }
    let addr: std::net::SocketAddr = format!("{}:{}", config.bind_address, config.port)
        .parse()
        .context("invalid metrics bind address")?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install prometheus exporter")?;
    info!("prometheus exporter listening on {}", addr);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Arc::new(
        Config::load_from_file(&cli.config)
            .with_context(|| format!("failed to load config from {}", cli.config.display()))?,
    );
    utils::logging::init_tracing(&config.logging);
    info!("ticket-core starting up");

    let db_manager = db::DatabaseManager::new(&config.database).await?;
    db_manager.migrate().await?;

    let command = cli.command();
    if command == Command::Migrate {
        info!("database schema is up to date");
        return Ok(());
    }

    let events = EventBus::default();
    let discord_client = Arc::new(DiscordClient::new(config.clone()));
    let app = Arc::new(TicketApp::new(
        db_manager,
        discord_client.clone(),
        events.clone(),
        &config,
    ));

    match command {
        Command::Migrate => Ok(()),
        Command::InitGuild { guild_id, owner_id } => {
            let (settings, roles) = app
                .roles()
                .initialize_guild(&Actor::system(), &guild_id, &owner_id)
                .await?;
            info!(
                "initialized guild guild_id={} owner_id={} roles={}",
                settings.guild_id,
                settings.owner_id,
                roles.len()
            );
            Ok(())
        }
        Command::Sweep => {
            discord_client.connect_rest().await?;
            let report = app.sweep().run_once().await?;
            info!(
                "reconciliation pass finished closed_missing_channel={} backfilled={} auto_closed={} failures={}",
                report.closed_missing_channel, report.backfilled, report.auto_closed, report.failures
            );
            Ok(())
        }
        Command::Run => run(config, app, discord_client, events).await,
    }
}

async fn run(
    config: Arc<Config>,
    app: Arc<TicketApp>,
    discord_client: Arc<DiscordClient>,
    events: EventBus,
) -> Result<()> {
    #[cfg(feature = "metrics")]
    install_metrics_exporter(&config.metrics)?;

    let _event_log = events::spawn_logging_listener(&events);
    discord_client.set_app(app.clone()).await;

    let gateway = discord_client.clone();
    let gateway_handle = tokio::spawn(async move {
        if let Err(e) = gateway.connect().await {
            error!("discord gateway error: {}", e);
            return;
        }
        gateway.closed().await;
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweep = app.sweep().clone();
    let sweep_enabled = config.reconciliation.enabled;
    let sweep_handle = tokio::spawn(async move {
        if sweep_enabled {
            sweep.run(shutdown_rx).await;
        } else {
            info!("reconciliation sweep disabled");
            std::future::pending::<()>().await;
        }
    });

    let web_server = WebServer::new(&config.web, app.clone());
    let web_handle = tokio::spawn(async move {
        if let Err(e) = web_server.start().await {
            error!("web server error: {}", e);
        }
    });

    tokio::select! {
        _ = web_handle => error!("web server stopped"),
        _ = gateway_handle => error!("discord gateway stopped"),
        _ = sweep_handle => error!("reconciliation sweep stopped"),
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("failed to listen for ctrl-c: {}", e);
            }
            info!("shutdown requested");
        }
    }

    let _ = shutdown_tx.send(true);
    discord_client.shutdown().await?;
    info!("ticket-core shutting down");
    Ok(())
}

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use vellum_codec::{KeyMaterial, Keyring};
use vellum_core::error::CoreError;
use vellum_core::retention::RetentionPolicy;
use vellum_core::tenant::SystemContext;
use vellum_core::AppState;
use vellum_util::time::SystemTimeSource;
use vellum_ws::{gateway_router, GatewayState};

mod cli;
mod config;
mod sweeps;

use cli::Command;
use config::{Config, LoggingConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    let config = Config::load(&args.config)?;
    init_tracing(&config.logging);
    if config.generated {
        tracing::info!("Generated default config at '{}'", args.config);
    }

    ensure_sqlite_dir(&config.database.url);
    let db = vellum_db::create_pool_full(
        &config.database.url,
        config.database.max_connections,
        Some(config.pg_options()),
    )
    .await?;
    vellum_db::run_migrations(&db).await?;

    let keyring = Keyring::with_master(KeyMaterial::from_hex(config.crypto.master_key_hex.trim())?);
    for key_id in &config.crypto.retired_key_ids {
        keyring.retire(key_id);
    }
    let state = AppState::new(
        db,
        Arc::new(keyring),
        Arc::new(SystemTimeSource),
        config.state_options(),
    );

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(state, &config).await,
        Command::VerifyChain { tenant, from, to } => {
            match state.chain.verify(tenant, from, to).await {
                Ok(checked) => {
                    println!("tenant {tenant}: {checked} entries verified");
                    Ok(())
                }
                Err(CoreError::Integrity(brk)) => anyhow::bail!(
                    "tenant {tenant}: chain broken at record {} (expected {}, found {}); \
                     writes are frozen until `unfreeze-chain --tenant {tenant}`",
                    brk.record_id,
                    brk.expected_hash,
                    brk.actual_hash
                ),
                Err(e) => Err(e.into()),
            }
        }
        Command::UnfreezeChain { tenant } => {
            if let Some(brk) = state.chain.frozen_reason(tenant).await? {
                tracing::warn!(
                    tenant_id = tenant,
                    record_id = brk.record_id,
                    "clearing audit chain freeze"
                );
            }
            if state.chain.unfreeze(tenant).await? {
                println!("tenant {tenant}: audit chain unfrozen");
            } else {
                println!("tenant {tenant}: audit chain was not frozen");
            }
            Ok(())
        }
        Command::AnonymizeUser { tenant, user } => {
            let count = state
                .retention
                .anonymize_user(&SystemContext(tenant), user)
                .await?;
            println!("tenant {tenant}: anonymized {count} messages of user {user}");
            Ok(())
        }
        Command::SetRetention { tenant, days, mode } => {
            state
                .retention
                .set_policy(
                    &SystemContext(tenant),
                    RetentionPolicy {
                        message_days: days,
                        mode,
                    },
                )
                .await?;
            println!("tenant {tenant}: messages kept {days} days, then {mode}");
            Ok(())
        }
        Command::SweepRetention => {
            let report = state.retention.run_scheduled_cleanup().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.filter.as_str()));
    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Create the parent directory of a file-backed SQLite database.
fn ensure_sqlite_dir(url: &str) {
    let Some(rest) = url.strip_prefix("sqlite://") else {
        return;
    };
    let path = rest.split('?').next().unwrap_or(rest);
    if path.is_empty() || path.starts_with(':') {
        return;
    }
    if let Some(parent) = std::path::Path::new(path).parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::warn!("Could not create directory '{}': {}", parent.display(), e);
        }
    }
}

async fn serve(state: AppState, config: &Config) -> Result<()> {
    let gateway = GatewayState::new(state.clone());
    let _delivery = gateway.broker.run(&state.event_bus);
    let _indexing = state.indexing.attach(&state.event_bus);
    let _sweeps = sweeps::spawn_background_tasks(&gateway, config);

    let app = gateway_router(gateway);
    let listener = tokio::net::TcpListener::bind(&config.server.bind_address).await?;
    tracing::info!(
        "Vellum gateway listening on ws://{}/gateway",
        listener.local_addr()?
    );

    let shutdown_notify = state.shutdown.clone();
    let shutdown_signal = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down (ctrl-c)...");
            }
            _ = shutdown_notify.notified() => {
                tracing::info!("Shutting down (requested)...");
            }
        }
        // Wake every open gateway session so it closes its socket.
        shutdown_notify.notify_waiters();
    };

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal)
        .await?;
    Ok(())
}

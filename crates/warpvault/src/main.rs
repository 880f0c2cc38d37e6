//! warpvault: the WarpGrid Vault renewal agent.
//!
//! Loads the `[vault]` section of a WarpGrid config, starts the renewer,
//! and keeps the tokens and leases named on the command line alive until
//! interrupted. A credential Vault refuses to renew is logged as an error;
//! the agent keeps renewing the rest.
//!
//! # Usage
//!
//! ```text
//! warpvault run --config /etc/warpgrid/warp.toml --token s.abc --lease database/creds/app/xyz
//! warpvault run --dev --token s.local
//! warpvault check-config --config /etc/warpgrid/warp.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use warpgrid_vault::{InMemoryVault, LeaseKind, RenewalErrors, VaultConfig, VaultRenewer};

#[derive(Parser)]
#[command(name = "warpvault", about = "WarpGrid Vault renewal agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Keep tokens and leases renewed until interrupted.
    Run {
        /// Config file with a `[vault]` table. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Token to renew (repeatable).
        #[arg(long = "token")]
        tokens: Vec<String>,

        /// Secret lease id to renew (repeatable).
        #[arg(long = "lease")]
        leases: Vec<String>,

        /// Increment to request in seconds; 0 uses task_token_ttl.
        #[arg(long, default_value = "0")]
        increment: u64,

        /// Renew against an in-memory Vault seeded with the given ids.
        #[arg(long)]
        dev: bool,
    },
    /// Validate a config file and print the resolved renewal policy.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,warpvault=debug,warpgrid_vault=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            tokens,
            leases,
            increment,
            dev,
        } => run_agent(config.as_deref(), tokens, leases, increment, dev).await,
        Command::CheckConfig { config } => check_config(&config),
    }
}

async fn run_agent(
    config_path: Option<&Path>,
    tokens: Vec<String>,
    leases: Vec<String>,
    increment: u64,
    dev: bool,
) -> anyhow::Result<()> {
    let mut config = match config_path {
        Some(path) => VaultConfig::from_file(path)?,
        None => VaultConfig::default(),
    };

    let renewer = if dev {
        config.enabled = true;
        let ttl = config.policy()?.task_token_ttl;
        let vault = Arc::new(InMemoryVault::new());
        for id in tokens.iter().chain(&leases) {
            vault.insert(id, ttl, true);
        }
        info!(seeded = tokens.len() + leases.len(), "using in-memory vault");
        VaultRenewer::new(&config, vault)?
    } else {
        if !config.enabled {
            anyhow::bail!("vault renewal is disabled; set enabled = true under [vault]");
        }
        VaultRenewer::from_config(&config)?
    };

    info!(address = %config.address, "WarpGrid vault agent starting");
    renewer.start().await;

    // ── Track credentials ──────────────────────────────────────

    let mut watchers = Vec::new();
    for token in tokens {
        match renewer.renew_token(&token, increment).await {
            Ok(errors) => watchers.push(watch_renewal(LeaseKind::Token, token, errors)),
            Err(e) => error!(token = %token, error = %e, "token not tracked"),
        }
    }
    for lease in leases {
        match renewer.renew_lease(&lease, increment).await {
            Ok(errors) => watchers.push(watch_renewal(LeaseKind::Lease, lease, errors)),
            Err(e) => error!(lease = %lease, error = %e, "lease not tracked"),
        }
    }

    if renewer.tracked_count() == 0 {
        warn!("nothing to renew");
    } else {
        info!(tracked = renewer.tracked_count(), "renewing credentials");
    }

    // ── Wait for shutdown ──────────────────────────────────────

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    renewer.stop().await;
    for watcher in watchers {
        let _ = watcher.await;
    }

    info!("WarpGrid vault agent stopped");
    Ok(())
}

/// Log the fate of one tracked credential.
fn watch_renewal(kind: LeaseKind, id: String, errors: RenewalErrors) -> JoinHandle<()> {
    tokio::spawn(async move {
        match errors.await {
            Ok(e) => error!(%kind, %id, error = %e, "renewal abandoned, credential will expire"),
            Err(_) => debug!(%kind, %id, "renewal released"),
        }
    })
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = VaultConfig::from_file(path)?;
    let policy = config.policy()?;

    println!("config:                    {}", path.display());
    println!("enabled:                   {}", config.enabled);
    println!("address:                   {}", config.address);
    println!("agent token:               {}", if config.token.is_some() { "set" } else { "unset" });
    println!("task token ttl:            {:?}", policy.task_token_ttl);
    println!("connection retry interval: {:?}", policy.connection_retry_interval);
    println!("renewal fraction:          {}", policy.renewal_fraction);
    println!("min renewal interval:      {:?}", policy.min_renewal_interval);
    println!("request timeout:           {:?}", config.request_timeout()?);
    println!("stop timeout:              {:?}", policy.stop_timeout);
    Ok(())
}

//! gmail-aggregator: unified unread/latest view across Gmail accounts
//!
//! Reads one OAuth token per account from a token directory, fetches message
//! metadata for every account concurrently, and merges the results into a
//! single JSON document served over HTTP or printed by one-shot commands.
//!
//! # Architecture
//!
//! - [`main`]: Process entry point with env loading, CLI, and serving
//! - [`config`]: Environment-driven configuration
//! - [`errors`]: Error model per layer with HTTP mapping
//! - [`token_store`]: Token directory access (list, load, save, delete)
//! - [`oauth`]: Authorization-code and refresh-token grants
//! - [`enrollment`]: Consent flow that adds an account's token
//! - [`credentials`]: Identifier to authenticated provider resolution
//! - [`provider`]: Mail Provider API abstraction
//! - [`gmail`]: Gmail REST implementation of the provider
//! - [`fetcher`]: Per-account message listing and shaping
//! - [`aggregator`]: Concurrent fan-out/fan-in across accounts
//! - [`server`]: HTTP routes
//! - [`models`]: Response DTOs and fetch modes

mod aggregator;
mod config;
mod credentials;
mod enrollment;
mod errors;
mod fetcher;
mod gmail;
mod models;
mod oauth;
mod provider;
mod server;
#[cfg(test)]
mod test_support;
mod token_store;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use reqwest::Client;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

use aggregator::Aggregator;
use config::AppConfig;
use credentials::GmailResolver;
use enrollment::{LoopbackFlow, PendingStates};
use errors::AppError;
use models::{DEFAULT_UNREAD_MAX, FetchMode};
use token_store::{FileTokenStore, TokenStore};

#[derive(Debug, Parser)]
#[command(name = "gmail-aggregator", version, about)]
struct Cli {
    /// Token directory (overrides GMAIL_AGG_TOKENS_DIR)
    #[arg(long, global = true)]
    tokens_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP API (default)
    Serve {
        /// Listen address (overrides GMAIL_AGG_BIND / PORT)
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
    /// Print unread messages for every account as JSON
    Unread {
        #[arg(long)]
        max: Option<u32>,
    },
    /// Print the newest inbox messages for every account as JSON
    Latest {
        #[arg(long)]
        max: Option<u32>,
    },
    /// Authorize a Gmail account in the browser and store its token
    Add,
    /// List token identifiers
    Accounts,
    /// Delete the token for one account
    Remove { email: String },
}

/// Application entry point
///
/// Loads `.env`, initializes tracing to stderr, builds configuration once,
/// and dispatches the CLI command.
///
/// # Environment Variables
///
/// See [`AppConfig::load_from_env`] for full configuration options.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::load_from_env()?;
    if let Some(dir) = cli.tokens_dir {
        config.tokens_dir = dir;
    }

    let store: Arc<dyn TokenStore> = Arc::new(FileTokenStore::new(config.tokens_dir.clone()));

    match cli.command.unwrap_or(Command::Serve { bind: None }) {
        Command::Serve { bind } => {
            if let Some(addr) = bind {
                config.bind = addr;
            }
            serve(config, store).await?;
        }
        Command::Unread { max } => {
            let max = config.resolve_max(Some(max.unwrap_or(DEFAULT_UNREAD_MAX)))?;
            print_aggregate(&config, store, FetchMode::Unread, max).await?;
        }
        Command::Latest { max } => {
            let max = config.resolve_max(max)?;
            print_aggregate(&config, store, FetchMode::Latest, max).await?;
        }
        Command::Add => {
            let http = http_client()?;
            let flow = LoopbackFlow::start(&config.oauth).await?;
            println!(
                "Open this URL in a browser to authorize an account:\n\n{}\n",
                flow.authorization_url
            );
            let email = flow
                .finish(&http, &config.oauth, &config.api_base, &store)
                .await?;
            println!("Successfully added account: {email}");
        }
        Command::Accounts => {
            for identifier in token_store::run_blocking(&store, |s| s.list_identifiers()).await? {
                println!("{identifier}");
            }
        }
        Command::Remove { email } => {
            token_store::validate_identifier(&email)?;
            let target = email.clone();
            token_store::run_blocking(&store, move |s| s.delete(&target)).await?;
            println!("User {email} deleted successfully");
        }
    }
    Ok(())
}

fn http_client() -> Result<Client, AppError> {
    Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| AppError::Internal(format!("failed to build HTTP client: {e}")))
}

fn build_aggregator(config: &AppConfig, store: Arc<dyn TokenStore>, http: Client) -> Aggregator {
    let resolver = GmailResolver::new(store, http, config);
    Aggregator::new(Arc::new(resolver))
        .with_account_timeout(config.account_timeout_ms.map(Duration::from_millis))
}

async fn print_aggregate(
    config: &AppConfig,
    store: Arc<dyn TokenStore>,
    mode: FetchMode,
    max: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let aggregator = build_aggregator(config, Arc::clone(&store), http_client()?);
    let result = aggregator.aggregate_all(&store, mode, max).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn serve(config: AppConfig, store: Arc<dyn TokenStore>) -> Result<(), Box<dyn std::error::Error>> {
    let http = http_client()?;
    let aggregator = build_aggregator(&config, Arc::clone(&store), http.clone());
    let bind = config.bind;
    let state = server::AppState {
        config: Arc::new(config),
        store,
        aggregator: Arc::new(aggregator),
        http,
        pending: Arc::new(Mutex::new(PendingStates::default())),
    };

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "listening");
    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["gmail-aggregator"]).expect("parses");
        assert!(cli.command.is_none());
    }

    #[test]
    fn global_tokens_dir_and_max_parse() {
        let cli = Cli::try_parse_from([
            "gmail-aggregator",
            "latest",
            "--max",
            "3",
            "--tokens-dir",
            "/tmp/tokens",
        ])
        .expect("parses");
        assert_eq!(cli.tokens_dir, Some(PathBuf::from("/tmp/tokens")));
        assert!(matches!(cli.command, Some(Command::Latest { max: Some(3) })));
    }

    #[test]
    fn add_subcommand_parses() {
        let cli = Cli::try_parse_from(["gmail-aggregator", "add"]).expect("parses");
        assert!(matches!(cli.command, Some(Command::Add)));
    }
}

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bankfetch::auth::{AuthEvent, DeepLinkBuilder, DeviceMode};
use bankfetch::browser::chrome::ChromeLauncher;
use bankfetch::config::{default_config_path, Config};
use bankfetch::models::Transaction;
use bankfetch::{BankClient, BankError};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use secrecy::SecretString;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "bankfetch")]
#[command(about = "Fetch bank transactions behind a BankID login")]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Log in, fetch transactions and print the reconciliation outcome
    Fetch {
        /// Personal identity number used for the BankID login
        #[arg(long, env = "BANKFETCH_IDENTITY", hide_env_values = true)]
        identity: String,

        /// Account display name, official name or number
        #[arg(long)]
        account: String,

        /// First date to include (YYYY-MM-DD)
        #[arg(long)]
        from: NaiveDate,

        /// Last date to include (YYYY-MM-DD)
        #[arg(long)]
        to: NaiveDate,

        /// JSON file with transactions already in the ledger
        #[arg(long)]
        existing: Option<PathBuf>,

        /// same-device or other-device
        #[arg(long, default_value = "other-device")]
        mode: DeviceMode,

        /// Show the browser window
        #[arg(long)]
        headed: bool,
    },

    /// Print the same-device BankID link for an auto-start token
    Deeplink {
        token: String,

        /// URL the app returns to after signing
        #[arg(long)]
        redirect: Option<String>,

        /// Use the app's native scheme instead of the https link
        #[arg(long)]
        native: bool,
    },

    /// Show current configuration
    Config,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,chromiumoxide=warn,chromiumoxide::conn=off,chromiumoxide::handler=off")
    });
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true);
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.json())
            .init();
    } else {
        tracing_subscriber::registry().with(filter).with(layer).init();
    }
}

fn load_existing(path: &Path) -> Result<Vec<Transaction>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read existing transactions: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse existing transactions: {}", path.display()))
}

/// Print token events to stderr so the user can scan or open them.
async fn print_events(mut events: broadcast::Receiver<AuthEvent>, links: DeepLinkBuilder) {
    loop {
        match events.recv().await {
            Ok(AuthEvent::QrTokenUpdated(token)) => eprintln!("QR token: {token}"),
            Ok(AuthEvent::SameDeviceTokenAvailable(token)) => {
                eprintln!("Open BankID: {}", links.same_device_link(&token, None));
            }
            Ok(AuthEvent::AuthExpired(message)) => eprintln!("Login expired: {message}"),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load_or_default(&config_path)?;

    match cli.command {
        Command::Fetch {
            identity,
            account,
            from,
            to,
            existing,
            mode,
            headed,
        } => {
            if headed {
                config.browser.headless = false;
            }
            let existing = match existing {
                Some(path) => load_existing(&path)?,
                None => Vec::new(),
            };
            let identity = SecretString::from(identity);
            let links = DeepLinkBuilder::new(&config.deeplink);
            let launcher = ChromeLauncher::new(config.browser.clone());
            let mut client = BankClient::new(config, launcher).with_existing_transactions(existing);

            let printer = tokio::spawn(print_events(client.subscribe(), links));
            let cancel = client.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupted, shutting down");
                    cancel.cancel();
                }
            });

            let result = async {
                client.initialize(&identity, &account, mode).await?;
                client.fetch_and_reconcile(from, to).await
            }
            .await;
            client.cleanup().await;
            printer.abort();

            match result {
                Ok(outcome) => println!("{}", serde_json::to_string_pretty(&outcome)?),
                Err(e) => {
                    report(&e);
                    std::process::exit(1);
                }
            }
        }
        Command::Deeplink {
            token,
            redirect,
            native,
        } => {
            let links = DeepLinkBuilder::new(&config.deeplink);
            let link = if native {
                links.native_link(&token, redirect.as_deref())
            } else {
                links.same_device_link(&token, redirect.as_deref())
            };
            println!("{link}");
        }
        Command::Config => {
            println!("Config file: {}", config_path.display());
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn report(error: &BankError) {
    eprintln!("Error: {error}");
    let alternatives = error.alternatives();
    if !alternatives.is_empty() {
        eprintln!("Available:");
        for alternative in alternatives {
            eprintln!("  {alternative}");
        }
    }
}

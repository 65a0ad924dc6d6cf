use std::path::PathBuf;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use contact_relay::{
    config::{self, Config, Credentials},
    relay::{RelaySettings, SmtpRelay},
    server::{self, AppState},
    transport::StartTlsConnector,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing();

    let config = config::load(&cli.config)?;

    match cli.command {
        Command::Serve => serve(config).await?,
        Command::CheckConfig { verbose } => {
            verbose.then(|| println!("{config:#?}"));
        }
    }

    Ok(())
}

#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// Path of the TOML config file
    #[arg(short, long, env = "CONTACT_RELAY_CONFIG", default_value = "config.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP server that relays contact form submissions
    #[command(aliases(["run", "start", "s"]))]
    Serve,
    /// Validate configuration
    CheckConfig {
        /// Print a debug representation of the config
        #[arg(short, long)]
        verbose: bool,
    },
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let smtp = config.smtp;
    let relay = match Credentials::from_env() {
        Some(credentials) => {
            let connector = StartTlsConnector::new(&smtp.endpoint.host, smtp.endpoint.port)
                .with_context(|| format!("Invalid smtp host {}", smtp.endpoint.host))?;
            info!(
                "relaying through {}:{} as {}",
                smtp.endpoint.host, smtp.endpoint.port, credentials.username
            );
            Some(SmtpRelay::new(
                connector,
                RelaySettings {
                    ehlo_domain: smtp.ehlo_domain,
                    sender_name: smtp.sender_name,
                    recipient: smtp.recipient,
                    credentials,
                    timeout: smtp.timeout.into(),
                },
            ))
        }
        None => {
            warn!(
                "{} and {} are not set, contact requests will be rejected",
                config::USERNAME_VAR,
                config::TOKEN_VAR
            );
            None
        }
    };

    let state = AppState::new(relay, config.cors.allowed_origins);
    server::serve(state, config.http.host, config.http.port).await
}

fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(EnvFilter::from_default_env()))
        .init();
}

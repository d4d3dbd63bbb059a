//! Aduket - Main Application
//!
//! Runs a programmable mock HTTP server, headless or with a live traffic TUI.

use aduket::{config::AppConfig, tui::TuiApp, MockServer};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, layer::SubscriberExt, util::SubscriberInitExt};

/// Aduket - Programmable Mock HTTP Server
#[derive(Parser)]
#[command(name = "aduket")]
#[command(about = "A programmable mock HTTP server with live traffic inspection")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path (TOML or JSON)
    #[arg(short, long, default_value = "aduket.json")]
    config: String,

    /// Server host
    #[arg(long, env = "ADUKET_HOST")]
    host: Option<String>,

    /// Server port
    #[arg(short, long, env = "ADUKET_PORT")]
    port: Option<u16>,

    /// Serve HTTPS with a self-signed certificate
    #[arg(long)]
    tls: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the mock server with the TUI dashboard
    Tui,
    /// Start the mock server headless, logging every exchange
    Serve,
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Tui);

    // Initialize logging; the TUI owns the terminal, so logs are discarded there
    let log_level = if cli.verbose { "debug" } else { "info" };
    let writer = match command {
        Commands::Tui => BoxMakeWriter::new(std::io::sink),
        _ => BoxMakeWriter::new(std::io::stderr),
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("aduket={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(writer))
        .init();

    // Load configuration
    let mut config = if std::path::Path::new(&cli.config).exists() {
        AppConfig::load_from_file(&cli.config).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to load config file, using defaults");
            AppConfig::default()
        })
    } else {
        AppConfig::load().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to load config, using defaults");
            AppConfig::default()
        })
    };

    // Override with CLI args
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if cli.tls {
        config.server.tls = true;
    }

    match command {
        Commands::Tui => {
            let server = start_server(&config).await?;
            let mut app = TuiApp::new(server);
            app.run().await?;
        }
        Commands::Serve => {
            let server = start_server(&config).await?;
            server.on_exchange(|exchange| {
                tracing::info!(
                    method = %exchange.method,
                    uri = %exchange.uri,
                    status = exchange.status_code,
                    body_bytes = exchange.body.len(),
                    "Exchange captured"
                );
            });

            tokio::signal::ctrl_c().await?;
            tracing::info!("Shutting down");
            server.close();
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// Build the mock server, register configured expectations and start listening
async fn start_server(config: &AppConfig) -> anyhow::Result<MockServer> {
    let server = MockServer::from_config(&config.server);

    if config.expectations.is_empty() {
        server.apply_config(&[AppConfig::default_expectation()])?;
    } else {
        server.apply_config(&config.expectations)?;
    }

    let addr = config.server.addr();
    if config.server.tls {
        server.listen_tls(&addr).await?;
    } else {
        server.listen(&addr).await?;
    }

    tracing::info!(
        url = %server.url().unwrap_or_default(),
        expectations = server.expectations().len(),
        "Aduket mock server started"
    );
    Ok(server)
}

//! Credential Gateway
//!
//! Forwards client requests to an upstream API through a rotating pool of
//! upstream credentials, each guarded by its own circuit breaker.

use anyhow::{Context, Result};
use clap::Parser;
use credential_gateway::{
    config::{Environment, Settings},
    logging::init_tracing,
    server::App,
};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "credential-gateway")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on (overrides PORT env var)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides HOST env var)
    #[arg(long)]
    host: Option<String>,

    /// Log level: trace, debug, info, warn, error (overrides LOG_LEVEL env var)
    #[arg(long)]
    log_level: Option<String>,

    /// Environment: development, staging, production (overrides ENVIRONMENT env var)
    #[arg(short, long)]
    env: Option<Environment>,

    /// Log file path for JSON logs (10MB rotation, 5 rotated files kept)
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Settings first, so the log level can come from them
    let mut settings = Settings::load().context("Failed to load settings")?;

    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(host) = args.host {
        settings.host = host;
    }
    if let Some(log_level) = args.log_level {
        settings.log_level = log_level;
    }
    if let Some(env) = args.env {
        settings.environment = env;
    }
    settings.validate().context("Invalid settings after CLI overrides")?;

    init_tracing(&settings.log_level, args.log_file.as_deref())?;

    // Without configured client tokens, mint one for this session
    if settings.require_api_key && settings.client_api_keys.is_empty() {
        let ephemeral_key = settings.generate_ephemeral_key();

        println!("\n{}", "=".repeat(60));
        println!("  Ephemeral client API key (valid for this session only):");
        println!("  {}", ephemeral_key);
        println!("{}\n", "=".repeat(60));
        println!("  Usage:");
        println!("    curl -H \"Authorization: Bearer {}\" \\", ephemeral_key);
        println!("         http://{}:{}/v1/models\n", settings.host, settings.port);
        println!("{}\n", "=".repeat(60));
    }

    tracing::info!(
        app_name = %settings.app_name,
        version = %settings.app_version,
        environment = %settings.environment,
        host = %settings.host,
        port = %settings.port,
        upstream = %settings.upstream.base_url,
        "Starting application"
    );

    let app = App::new(settings).await?;
    app.run_with_graceful_shutdown().await?;

    tracing::info!("Application shutdown complete");
    Ok(())
}

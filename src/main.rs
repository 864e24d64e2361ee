use clap::{ArgAction, Parser, Subcommand};
use rustyrelay::config::Config;
use rustyrelay::proxy::{RelayServer, RelaySettings};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "rustyrelay",
    about = "A transparent TCP relay with TLS unwrapping and HTTP payload injection",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(long, default_value = "rustyrelay.yaml")]
    config: PathBuf,

    /// Local listen address
    #[arg(short, long)]
    local: Option<String>,

    /// Remote address
    #[arg(short, long)]
    remote: Option<String>,

    /// Server address (host:port) used by [host] and [host_port]
    #[arg(short, long)]
    server: Option<String>,

    /// Display server actions (-vv also displays all relayed data)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Disable Nagle's algorithm
    #[arg(short = 'n', long)]
    no_nagle: bool,

    /// Output relayed data as hex
    #[arg(short = 'x', long)]
    hex: bool,

    /// Output ANSI colors
    #[arg(short, long)]
    color: bool,

    /// Connect to the remote over TLS and expose it unencrypted locally
    #[arg(long)]
    unwrap_tls: bool,

    /// TLS dial target (defaults to the remote address)
    #[arg(long)]
    tls_target: Option<String>,

    /// Extra CA certificates (PEM) trusted when unwrapping TLS
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Outbound payload replacing CONNECT requests
    #[arg(long)]
    out_payload: Option<String>,

    /// Incoming payload replacing HTTP responses
    #[arg(long)]
    in_payload: Option<String>,

    /// Answer WebSocket upgrades locally
    #[arg(long)]
    reverse_proxy: bool,

    /// Largest outbound buffer eligible for rewriting
    #[arg(long)]
    max_out_filter: Option<usize>,

    /// Largest incoming buffer eligible for rewriting
    #[arg(long)]
    max_in_filter: Option<usize>,

    /// Only rewrite the first buffer of each direction
    #[arg(long)]
    first_buffer_only: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (text, json)
    #[arg(long)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate default configuration file
    Init {
        /// Output file path
        #[arg(short, long, default_value = "rustyrelay.yaml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut cli = Cli::parse();

    if let Some(command) = cli.command.take() {
        return handle_command(command);
    }

    let mut config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        Config::default()
    };

    apply_cli(&mut config, &cli);

    setup_logging(&config)?;

    info!(
        "rustyrelay ({}) proxying from {} to {}",
        env!("CARGO_PKG_VERSION"),
        config.listen_addr(),
        config.relay.remote
    );

    let settings = match RelaySettings::from_config(&config).await {
        Ok(settings) => settings,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        info!("Received Ctrl+C, shutting down...");
        shutdown_token.cancel();
    });

    let server = RelayServer::new(settings);
    if let Err(e) = server.run(cancel_token).await {
        error!("Failed to open local port to listen: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Init { output } => {
            Config::create_default(&output)?;
            println!("Configuration file created: {:?}", output);
        }
    }
    Ok(())
}

fn apply_cli(config: &mut Config, cli: &Cli) {
    if let Some(local) = &cli.local {
        config.relay.listen = local.clone();
    }
    if let Some(remote) = &cli.remote {
        config.relay.remote = remote.clone();
    }
    if let Some(server) = &cli.server {
        config.relay.server = Some(server.clone());
    }
    if cli.no_nagle {
        config.relay.nagle = false;
    }
    if cli.unwrap_tls {
        config.relay.unwrap_tls = true;
    }
    if let Some(target) = &cli.tls_target {
        config.relay.tls_target = Some(target.clone());
    }
    if let Some(ca_cert) = &cli.ca_cert {
        config.relay.ca_cert = Some(ca_cert.to_string_lossy().to_string());
    }
    if cli.reverse_proxy {
        config.relay.reverse_proxy = true;
    }
    if let Some(payload) = &cli.out_payload {
        config.payload.outbound = payload.clone();
    }
    if let Some(payload) = &cli.in_payload {
        config.payload.incoming = payload.clone();
    }
    if let Some(size) = cli.max_out_filter {
        config.payload.max_outbound_filter_bytes = size;
    }
    if let Some(size) = cli.max_in_filter {
        config.payload.max_inbound_filter_bytes = size;
    }
    if cli.first_buffer_only {
        config.payload.filter_mode = rustyrelay::rules::FilterMode::FirstBuffer;
    }
    if cli.hex {
        config.logging.hex = true;
    }
    if cli.color {
        config.logging.color = true;
    }
    match cli.verbose {
        0 => {}
        1 => config.logging.level = "debug".to_string(),
        _ => config.logging.level = "trace".to_string(),
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        config.logging.format = format.clone();
    }
}

fn setup_logging(config: &Config) -> anyhow::Result<()> {
    let level = match config.logging.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("rustls=warn".parse()?);

    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(config.logging.color),
            )
            .init();
    }

    Ok(())
}

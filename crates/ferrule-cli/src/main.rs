#![deny(unsafe_code)]

//! Ferrule CLI — command-line control plane.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ferrule_core::{Channel, Event, InvokeReply, InvokeRequest, Message};

/// Ferrule — a Unix-socket IPC channel server.
#[derive(Parser)]
#[command(name = "ferrule", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "ferrule.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a channel server with the built-in echo service.
    Serve {
        /// Channel name; determines the socket file name.
        #[arg(long, default_value = "ferrule")]
        name: String,

        /// Post a heartbeat event at this interval in seconds (0 = off).
        #[arg(long, default_value_t = 5)]
        heartbeat: u64,
    },

    /// Ping a running channel server.
    Ping {
        /// Path to the channel socket.
        socket: PathBuf,
    },

    /// Subscribe to a channel's events and print them.
    Listen {
        /// Path to the channel socket.
        socket: PathBuf,

        /// Service name to subscribe to.
        #[arg(long, default_value = "heartbeat")]
        service: String,

        /// Event mask bits (default: all types).
        #[arg(long, default_value_t = u32::MAX)]
        mask: u32,
    },

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up tracing subscriber with verbosity level
    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    match cli.command {
        Commands::Serve { name, heartbeat } => cmd_serve(&cli.config, &name, heartbeat).await?,
        Commands::Ping { socket } => cmd_ping(&socket).await?,
        Commands::Listen {
            socket,
            service,
            mask,
        } => cmd_listen(&socket, &service, mask).await?,
        Commands::Config { show } => cmd_config(&cli.config, show)?,
    }

    Ok(())
}

async fn cmd_serve(config_path: &Path, name: &str, heartbeat: u64) -> Result<()> {
    let config = load_config(config_path)?;
    info!(name, "starting Ferrule channel");

    let channel = Channel::init(name, config.channel, None).map_err(|e| anyhow::anyhow!(e))?;

    // A smoke-test service: echoes its argument message back.
    channel
        .handlers()
        .add("echo", 1, |req: InvokeRequest| async move {
            InvokeReply::with_output(req.args)
        })
        .map_err(|e| anyhow::anyhow!(e))?;

    if heartbeat > 0 {
        let beat = std::sync::Arc::clone(&channel);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(heartbeat));
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                let mut payload = Message::new();
                payload.push(bytes::Bytes::from_static(b"alive"));
                match Event::new("heartbeat", 0, payload) {
                    Ok(event) => {
                        if beat.post_event(event, None).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });
    }

    println!("listening on {}", channel.socket_path().display());
    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, shutting down");
    channel.fini().await.map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}

async fn cmd_ping(socket: &Path) -> Result<()> {
    let mut client = ferrule_client::Client::connect(socket).await?;
    client.ping(0xF00D).await?;
    println!("channel at '{}' is alive", socket.display());
    Ok(())
}

async fn cmd_listen(socket: &Path, service: &str, mask: u32) -> Result<()> {
    let client = ferrule_client::Client::connect(socket).await?;
    let mut listener = client.into_event_listener().await?;
    listener.mask_add(service, mask).await?;
    info!(service, mask, "listening for events");

    loop {
        let notice = listener.next_event().await?;
        println!(
            "event serial={} type={} name={} frames={}",
            notice.serial,
            notice.evtype,
            notice.name,
            notice.payload.len()
        );
    }
}

fn cmd_config(config_path: &Path, show: bool) -> Result<()> {
    let config = load_config(config_path)?;
    if show {
        let toml_str =
            toml::to_string_pretty(&config).map_err(|e| anyhow::anyhow!("TOML error: {e}"))?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", config_path.display());
    }
    Ok(())
}

fn load_config(path: &Path) -> Result<ferrule_config::AppConfig> {
    if path.exists() {
        ferrule_config::AppConfig::load(path).map_err(|e| anyhow::anyhow!(e))
    } else {
        info!(path = %path.display(), "Config file not found, using defaults");
        Ok(ferrule_config::AppConfig::default())
    }
}

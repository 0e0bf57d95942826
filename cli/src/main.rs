// punch — UDP hole-punching rendezvous CLI
//
// `punch serve` runs the rendezvous server; `punch chat` registers at it and
// opens direct peer-to-peer UDP chat through NAT.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use holepunch_core::{RendezvousServer, Session, SessionError, SessionEvent};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "punch")]
#[command(about = "punch — UDP rendezvous and NAT hole-punching", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the rendezvous server
    Serve {
        /// Bind address, e.g. 0.0.0.0:5555
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Start an interactive peer session
    Chat {
        /// Client id to register under
        id: String,
        /// Rendezvous server address, e.g. 203.0.113.1:5555
        #[arg(short, long)]
        server: Option<String>,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { bind } => cmd_serve(bind).await,
        Commands::Chat { id, server } => cmd_chat(id, server).await,
        Commands::Config { action } => cmd_config(action).await,
    }
}

async fn cmd_serve(bind: Option<String>) -> Result<()> {
    let mut config = config::Config::load()?;
    if let Some(bind) = bind {
        config.bind_addr = bind;
    }
    debug!("effective bind address: {}", config.bind_addr);

    let server = RendezvousServer::bind(config.server_config()?)
        .await
        .context("Failed to start rendezvous server")?;
    println!(
        "{} Rendezvous server listening on {}",
        "✓".green(),
        server.local_addr()?.to_string().bright_cyan()
    );

    server.run().await.context("Server terminated")?;
    Ok(())
}

async fn cmd_chat(id: String, server: Option<String>) -> Result<()> {
    let mut config = config::Config::load()?;
    if let Some(server) = server {
        config.server_addr = server;
    }
    let client_config = config.client_config()?;
    let server_addr = client_config.server_addr;

    println!("{}", "=== punch — P2P chat ===".green().bold());
    println!(
        "Checking server {}...",
        server_addr.to_string().bright_cyan()
    );

    let (event_tx, mut event_rx) = mpsc::channel(256);
    let session = match Session::connect(id.clone(), client_config, event_tx).await {
        Ok(session) => session,
        Err(e @ SessionError::ServerUnreachable { .. }) => {
            eprintln!(
                "{}",
                "Error: cannot reach the rendezvous server. Check:".red()
            );
            eprintln!("  1. The server address is correct: {server_addr}");
            eprintln!("  2. The server process is running");
            eprintln!("  3. The firewall allows UDP traffic");
            return Err(e.into());
        }
        Err(e) => return Err(e).context("Failed to start session"),
    };

    println!(
        "{} Server reachable, registered as {}",
        "✓".green(),
        id.bright_cyan()
    );
    println!(
        "{} Local port: {}",
        "✓".green(),
        session.local_addr()?.port()
    );
    show_help();

    let session = Arc::new(session);

    let event_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                SessionEvent::PeerMessage { from, text } => {
                    println!("\n{} {}", format!("[from {from}]").yellow(), text);
                }
                SessionEvent::PunchReceived { from } => {
                    println!(
                        "\n{} hole-punch from {}",
                        "✓".green(),
                        from.to_string().bright_cyan()
                    );
                }
                SessionEvent::ServerNotice { text } => {
                    println!("\n{} {}", "[server]".blue(), text);
                }
                SessionEvent::TransportError { error } => {
                    println!("\n{} network error: {}", "✗".red(), error);
                    break;
                }
            }
            prompt();
        }
    });

    let stdin_session = Arc::clone(&session);
    let stdin_task = tokio::spawn(async move {
        use tokio::io::AsyncBufReadExt;

        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();

        prompt();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();

            if line.is_empty() {
                prompt();
                continue;
            }

            if line == "/exit" {
                stdin_session.shutdown();
                break;
            }

            if line == "/help" {
                show_help();
                prompt();
                continue;
            }

            if line == "/list" {
                match stdin_session.list_peers().await {
                    Ok(peers) if peers.is_empty() => println!("No other peers online."),
                    Ok(peers) => {
                        println!("Online peers:");
                        for peer in peers {
                            println!("  {} {}", "•".bright_green(), peer.bright_cyan());
                        }
                    }
                    Err(e) => println!("{} {}", "✗".red(), e),
                }
                prompt();
                continue;
            }

            if let Some(peer_id) = line.strip_prefix("/connect ") {
                let peer_id = peer_id.trim();
                match stdin_session.query_peer(peer_id).await {
                    Ok(Some(endpoint)) => println!(
                        "{} Connected: {} at {}",
                        "✓".green(),
                        peer_id.bright_cyan(),
                        endpoint
                    ),
                    Ok(None) => println!("{} No such peer: {}", "✗".red(), peer_id),
                    Err(e) => println!("{} {}", "✗".red(), e),
                }
                prompt();
                continue;
            }

            // Anything else, unrecognized slash-prefixed lines included,
            // goes verbatim to the connected peer
            match stdin_session.send_chat(line).await {
                Ok(endpoint) => println!("{} sent to {}", "→".bright_green(), endpoint),
                Err(e) => println!("{} {}", "✗".red(), e),
            }
            prompt();
        }
    });

    tokio::select! {
        _ = event_task => {}
        _ = stdin_task => {}
        _ = tokio::signal::ctrl_c() => {
            println!("\nInterrupted");
        }
    }

    session.shutdown();
    info!("chat session {id} closed");
    Ok(())
}

async fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<22} {}", key.bright_cyan(), value);
            }
        }
    }

    Ok(())
}

fn show_help() {
    println!("{}", "  ======== commands ========".blue());
    println!("  {}  connect to a peer", "/connect <id>".bright_green());
    println!("  {}          show online peers", "/list".bright_green());
    println!("  {}          show this help", "/help".bright_green());
    println!("  {}          quit", "/exit".bright_green());
    println!("  anything else is sent to the connected peer");
    println!("{}", "  ==========================".blue());
}

fn prompt() {
    print!("> ");
    let _ = std::io::Write::flush(&mut std::io::stdout());
}

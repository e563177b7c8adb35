//! lanchatd: serverless LAN group chat, line mode.
//!
//! Start one instance per terminal on the same network (or host) and they
//! find each other on their own. Type to talk; /peers, /history,
//! /name <new>, /quit.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use lanchat_core::config::ChatConfig;
use lanchat_core::wire::DEFAULT_MULTICAST_ADDR;
use lanchat_net::chat::ChatService;

/// Serverless group chat for the local network.
#[derive(Parser, Debug)]
#[command(name = "lanchatd")]
#[command(about = "Serverless LAN group chat over multicast discovery and a TCP mesh")]
struct Args {
    /// Display name (1-20 characters, no whitespace)
    #[arg(short, long, env = "LANCHAT_USERNAME", default_value = "anon")]
    username: String,

    /// TCP listen port for chat connections (0 = OS-assigned)
    #[arg(short, long, env = "LANCHAT_PORT", default_value_t = 8080)]
    port: u16,

    /// Multicast group for peer discovery
    #[arg(short, long, env = "LANCHAT_MULTICAST", default_value = DEFAULT_MULTICAST_ADDR)]
    multicast: String,

    /// Append debug logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<std::path::PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;

    let config = ChatConfig {
        username: args.username.clone(),
        tcp_port: args.port,
        multicast_addr: args.multicast.clone(),
        log_file: args.log_file.clone(),
        ..ChatConfig::default()
    };

    let service = ChatService::new(config).context("failed to create chat service")?;
    service.start().await.context("failed to start chat service")?;
    tracing::info!(port = service.local_port(), peer_id = %service.peer_id(), "lanchatd up");

    println!(
        "listening on tcp {} as {} ({})",
        service.local_port(),
        service.username(),
        service.peer_id()
    );
    println!("type to chat; /peers, /history, /name <new>, /quit");

    let mut inbound = service
        .take_inbound()
        .ok_or_else(|| anyhow!("inbound stream unavailable"))?;
    let printer = tokio::spawn(async move {
        while let Some(msg) = inbound.recv().await {
            if msg.is_user_visible() {
                println!("{msg}");
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Some(command) = line.strip_prefix('/') {
                    if !run_command(&service, command) {
                        break;
                    }
                    continue;
                }
                if let Err(e) = service.send_message(line) {
                    eprintln!("error: {e}");
                }
            }
        }
    }

    println!("shutting down...");
    service.stop().await;
    printer.abort();
    Ok(())
}

/// Handle a /command. Returns false when it is time to quit.
fn run_command(service: &ChatService, command: &str) -> bool {
    let (name, rest) = command.split_once(' ').unwrap_or((command, ""));
    match name {
        "quit" | "q" => return false,
        "peers" => {
            let peers = service.snapshot_peers();
            if peers.is_empty() {
                println!("no peers yet");
            }
            for p in peers {
                println!(
                    "  {} ({}) {} {} retries={}",
                    p.username, p.peer_id, p.address, p.state, p.retry_count
                );
            }
            let status = service.status();
            println!(
                "  {} discovered, {} connected, {} messages sent",
                status.discovered_peers, status.connected_peers, status.messages_sent
            );
        }
        "history" => {
            for msg in service.get_history(Some(20)) {
                if msg.is_user_visible() {
                    println!("{msg}");
                }
            }
        }
        "name" => {
            if let Err(e) = service.change_username(rest.trim()) {
                eprintln!("error: {e}");
            } else {
                println!("you are now {}", service.username());
            }
        }
        other => eprintln!("unknown command: /{other}"),
    }
    true
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::EnvFilter::from_default_env()
    } else if args.verbose {
        tracing_subscriber::EnvFilter::new("lanchat_core=debug,lanchat_net=debug,lanchatd=debug")
    } else {
        tracing_subscriber::EnvFilter::new("warn")
    };

    match &args.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(file)
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

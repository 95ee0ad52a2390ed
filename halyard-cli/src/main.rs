//! halyard: connect to every configured IRC network, print the refined
//! event stream and take line commands on stdin.

mod command;
mod config;
mod render;

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Parser;
use halyard_sdk::engine::Engine;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use command::Command;

#[derive(Parser)]
#[command(name = "halyard", about = "Multi-server IRC client on the halyard engine")]
struct Args {
    /// Config file (default: ~/.config/halyard/halyard.toml)
    #[arg(long, env = "HALYARD_CONFIG")]
    config: Option<PathBuf>,

    /// Only connect these server ids at startup (repeatable)
    #[arg(long = "server")]
    servers: Vec<String>,

    /// Start without connecting; use /connect
    #[arg(long)]
    no_connect: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let json_logs = std::env::var("HALYARD_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "halyard=info,halyard_sdk=info".into());
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let args = Args::parse();
    let path = config::resolve(args.config.as_deref());
    let engine_config = config::load(&path)?;
    if engine_config.servers.is_empty() {
        bail!("no [[servers]] in {}", path.display());
    }
    let engine = Engine::from_config(engine_config)?;
    tracing::info!(config = %path.display(), servers = engine.server_ids().len(), "Starting halyard");

    let mut events = engine.events();
    if !args.no_connect {
        for id in engine.server_ids() {
            if args.servers.is_empty() || args.servers.iter().any(|s| s == id.as_str()) {
                engine.connect(&id).await?;
            }
        }
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            ev = events.recv() => {
                let Some(ev) = ev else { break };
                if let Some(line) = render::render(&ev) {
                    println!("{line}");
                }
            }
            line = stdin.next_line(), if stdin_open => {
                let Some(line) = line? else {
                    stdin_open = false;
                    continue;
                };
                match command::parse(&line) {
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(cmd)) => {
                        if let Err(e) = run(&engine, cmd).await {
                            eprintln!("error: {e}");
                        }
                    }
                    Ok(None) => {}
                    Err(usage) => eprintln!("{usage}"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    engine.shutdown().await;
    Ok(())
}

async fn run(engine: &Engine, cmd: Command) -> halyard_sdk::Result<()> {
    match cmd {
        Command::Message { server, target, text } => {
            engine.send_message(&server, &target, &text).await?;
        }
        Command::Notice { server, target, text } => {
            engine.send_notice(&server, &target, &text).await?;
        }
        Command::Action { server, target, text } => {
            engine.send_action(&server, &target, &text).await?;
        }
        Command::Quote { server, line } => engine.send_raw(&server, &line).await?,
        Command::Labeled { server, context, line } => engine.send_labeled(&server, &line, &context).await?,
        Command::Connect(server) => engine.connect(&server).await?,
        Command::Disconnect { server, reason } => engine.disconnect(&server, reason.as_deref()).await?,
        Command::Quit => {}
    }
    Ok(())
}

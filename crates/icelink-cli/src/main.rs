//! icelink CLI
//!
//! Runs a controlled-role ICE agent with stdin/stdout as the signaling
//! channel: local candidate lines are printed as they are gathered, remote
//! candidate lines are read until a blank line, and once a pair is selected
//! stdin lines are sent to the peer and peer datagrams printed.

mod config;

use anyhow::Context;
use clap::Parser;
use icelink_agent::{Agent, Candidate, DataStream};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use config::Config;

/// icelink - NAT traversal with a controlled ICE agent
#[derive(Parser)]
#[command(name = "icelink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Gather IPv6 host candidates
    #[arg(short = '6', long = "ipv6")]
    ipv6: bool,

    /// Media stream identification tag
    #[arg(long)]
    mid: Option<String>,

    /// Local username fragment (random if not set)
    #[arg(long)]
    ufrag: Option<String>,

    /// Local password (random if not set)
    #[arg(long)]
    pwd: Option<String>,

    /// Peer's username fragment
    #[arg(long)]
    remote_ufrag: Option<String>,

    /// Peer's password
    #[arg(long)]
    remote_pwd: Option<String>,

    /// STUN server for reflexive candidates (host:port), repeatable
    #[arg(long = "stun", value_name = "SERVER")]
    stun: Vec<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug output (every STUN message)
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    apply_overrides(&mut config, &cli);
    config.generate_missing_credentials();
    config.validate()?;

    // Initialize logging; stdout carries candidates and data
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_filter(&cli, &config.logging.level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let agent_config = config
        .to_agent_config()
        .await
        .context("Invalid agent configuration")?;
    eprintln!("ice-ufrag:{}", agent_config.credentials.local_ufrag);
    eprintln!("ice-pwd:{}", &*agent_config.credentials.local_password);

    let agent = Agent::new();
    agent.configure(agent_config).context("Failed to configure agent")?;

    let (remote_tx, remote_rx) = mpsc::channel(16);
    let local = agent.start(remote_rx).context("Failed to start agent")?;
    tokio::spawn(print_local_candidates(local));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    read_remote_candidates(&mut lines, remote_tx).await?;

    let stream = tokio::select! {
        stream = agent.get_data_stream() => stream?,
        _ = tokio::signal::ctrl_c() => {
            agent.shutdown();
            return Ok(());
        }
    };
    eprintln!(
        "Connected: {} -> {}",
        stream.local_addr(),
        stream.remote_addr()
    );

    let result = relay(stream, &mut lines).await;
    agent.shutdown();
    result
}

fn apply_overrides(config: &mut Config, cli: &Cli) {
    let agent = &mut config.agent;
    agent.enable_ipv6 |= cli.ipv6;
    if let Some(mid) = &cli.mid {
        agent.mid.clone_from(mid);
    }
    for (target, value) in [
        (&mut agent.ufrag, &cli.ufrag),
        (&mut agent.pwd, &cli.pwd),
        (&mut agent.remote_ufrag, &cli.remote_ufrag),
        (&mut agent.remote_pwd, &cli.remote_pwd),
    ] {
        if value.is_some() {
            target.clone_from(value);
        }
    }
    if !cli.stun.is_empty() {
        agent.stun_servers.clone_from(&cli.stun);
    }
}

fn log_filter(cli: &Cli, configured: &str) -> String {
    if cli.debug {
        "icelink_agent=trace,icelink_cli=trace,info".to_string()
    } else if cli.verbose {
        "icelink_agent=debug,icelink_cli=debug,info".to_string()
    } else {
        configured.to_lowercase()
    }
}

/// Print local candidates as they arrive; a blank line ends the list
async fn print_local_candidates(mut local: mpsc::Receiver<Candidate>) {
    while let Some(candidate) = local.recv().await {
        println!("{candidate}");
    }
    println!();
}

/// Read remote candidate lines until a blank line or EOF
async fn read_remote_candidates(
    lines: &mut Lines<BufReader<Stdin>>,
    remote_tx: mpsc::Sender<Candidate>,
) -> anyhow::Result<()> {
    while let Some(line) = lines
        .next_line()
        .await
        .context("Failed to read remote candidates from stdin")?
    {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        let line = line.strip_prefix("a=").unwrap_or(line);
        match line.parse::<Candidate>() {
            Ok(candidate) => {
                if remote_tx.send(candidate).await.is_err() {
                    break;
                }
            }
            Err(e) => eprintln!("Skipping remote candidate: {e}"),
        }
    }
    tracing::debug!("Remote candidates complete");
    Ok(())
}

/// Relay stdin lines to the peer and peer datagrams to stdout
async fn relay(mut stream: DataStream, lines: &mut Lines<BufReader<Stdin>>) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("Failed to read data from stdin")? {
                Some(line) => {
                    stream.send(line.as_bytes()).await.context("Failed to send to peer")?;
                }
                None => break,
            },
            data = stream.recv() => match data {
                Some(data) => println!("{}", String::from_utf8_lossy(&data)),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\nShutting down...");
                break;
            }
        }
    }
    Ok(())
}

// src/main.rs

//! A small command-line client: runs one command, or prints published
//! messages in subscribe mode.

use anyhow::{Context, Result, anyhow};
use futures::StreamExt;
use spinel_client::config::ClientConfig;
use spinel_client::{Client, Command, Message};
use std::env;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "Usage: spinel-cli [--config FILE] [--url URL] [--host HOST] [--port PORT] \
[--db N] [--subscribe c1,c2] [--psubscribe p1,p2] [COMMAND ARGS...]";

/// Parsed command-line options.
#[derive(Debug, Default)]
struct CliArgs {
    config_path: Option<String>,
    url: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    database: Option<usize>,
    channels: Vec<String>,
    patterns: Vec<String>,
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();

    if args.iter().any(|arg| arg == "--version") {
        println!("spinel-cli version {VERSION}");
        return Ok(());
    }
    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        println!("{USAGE}");
        return Ok(());
    }

    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{e}\n{USAGE}");
            std::process::exit(1);
        }
    };

    let config = match load_config(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {e:#}");
            std::process::exit(1);
        }
    };

    // Get the log level from the env var or the config.
    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(log_level))
        .with_writer(std::io::stderr)
        .compact()
        .with_ansi(true)
        .init();

    if let Err(e) = run(config, cli).await {
        error!("{e:#}");
        return Err(e);
    }
    Ok(())
}

fn parse_args(args: &[String]) -> Result<CliArgs> {
    let mut cli = CliArgs::default();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| {
            iter.next()
                .cloned()
                .ok_or_else(|| anyhow!("{flag} flag requires a value"))
        };
        match arg.as_str() {
            "--config" => cli.config_path = Some(value("--config")?),
            "--url" => cli.url = Some(value("--url")?),
            "--host" => cli.host = Some(value("--host")?),
            "--port" => {
                let port = value("--port")?;
                cli.port = Some(
                    port.parse()
                        .with_context(|| format!("Invalid port number: {port}"))?,
                );
            }
            "--db" => {
                let db = value("--db")?;
                cli.database = Some(
                    db.parse()
                        .with_context(|| format!("Invalid database index: {db}"))?,
                );
            }
            "--subscribe" => cli.channels.extend(split_list(&value("--subscribe")?)),
            "--psubscribe" => cli.patterns.extend(split_list(&value("--psubscribe")?)),
            _ => {
                // Everything from the first positional argument on is the command.
                cli.command.push(arg.clone());
                cli.command.extend(iter.by_ref().cloned());
            }
        }
    }
    Ok(cli)
}

fn split_list(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Builds the config: file or URL first, then individual flags on top.
fn load_config(cli: &CliArgs) -> Result<ClientConfig> {
    let mut config = match (&cli.config_path, &cli.url) {
        (Some(_), Some(_)) => return Err(anyhow!("--config and --url are mutually exclusive")),
        (Some(path), None) => ClientConfig::from_file(path)?,
        (None, Some(url)) => ClientConfig::from_url(url)?,
        (None, None) => ClientConfig::default(),
    };

    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(db) = cli.database {
        config.database = Some(db);
    }
    config.validate()?;
    Ok(config)
}

async fn run(config: ClientConfig, cli: CliArgs) -> Result<()> {
    if !cli.channels.is_empty() || !cli.patterns.is_empty() {
        return subscribe_mode(config, &cli.channels, &cli.patterns).await;
    }

    let command = Command::from_parts(&cli.command)
        .ok_or_else(|| anyhow!("no command given\n{USAGE}"))?;
    let client = Client::connect(config).await?;
    match client.send(command).await {
        Ok(reply) => println!("{reply}"),
        // Error replies are printed like any other reply, not as a failure.
        Err(spinel_client::ClientError::Server(msg)) => println!("(error) {msg}"),
        Err(e) => return Err(e.into()),
    }
    client.close().await;
    Ok(())
}

async fn subscribe_mode(config: ClientConfig, channels: &[String], patterns: &[String]) -> Result<()> {
    let client = Client::lazy(config)?;
    let mut subscriber = client.subscriber();
    if !channels.is_empty() {
        subscriber.subscribe(channels.iter().cloned()).await?;
    }
    if !patterns.is_empty() {
        subscriber.psubscribe(patterns.iter().cloned()).await?;
    }
    info!(
        "Reading messages... (press Ctrl-C to quit). Channels: {channels:?}, patterns: {patterns:?}"
    );

    let close = subscriber.close_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            close.close();
        }
    });

    let mut messages = Box::pin(subscriber.receive());
    while let Some(item) = messages.next().await {
        match item? {
            Message::Channel { channel, payload } => {
                println!("1) \"message\"\n2) \"{channel}\"\n3) \"{payload}\"");
            }
            Message::Pattern {
                pattern,
                channel,
                payload,
            } => {
                println!("1) \"pmessage\"\n2) \"{pattern}\"\n3) \"{channel}\"\n4) \"{payload}\"");
            }
        }
    }
    Ok(())
}

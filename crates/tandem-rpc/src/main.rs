//! Tandem RPC - command-line server and client.
//!
//! `serve` runs a server that admits devices and answers a few built-in
//! methods; `call` connects as a device, makes one call and prints the result;
//! `attach` connects with reconnection and stays online so the server can call
//! the device.

mod handlers;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use tandem_core::{
    Client, ClientConfig, EventBus, MethodRegistry, ReconnectPolicy, ReconnectingClient, RpcEvent,
    Server, ServerConfig,
};
use tokio::sync::broadcast;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "tandem-rpc")]
#[command(about = "Symmetric JSON RPC server and client")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a server
    Serve {
        /// Port to listen on (0 = auto-assign)
        #[arg(short, long, default_value = "0")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Only admit these tokens (repeatable). Admits everyone when empty.
        #[arg(long = "allow")]
        allow: Vec<String>,
    },
    /// Connect as a device, call one method and print the result
    Call {
        /// Server address
        #[arg(long, default_value = "127.0.0.1:7400")]
        addr: String,

        /// Identity token
        #[arg(long)]
        token: String,

        /// Method to call
        method: String,

        /// JSON parameters
        #[arg(default_value = "null")]
        params: String,

        /// Call timeout in seconds
        #[arg(long, default_value = "10")]
        timeout: u64,
    },
    /// Connect as a device and stay online, reconnecting when dropped
    Attach {
        /// Server address
        #[arg(long, default_value = "127.0.0.1:7400")]
        addr: String,

        /// Identity token
        #[arg(long)]
        token: String,

        /// Seconds between reconnect attempts
        #[arg(long, default_value = "2")]
        retry: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging; RUST_LOG overrides the --debug switch
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match args.command {
        Command::Serve { port, host, allow } => serve(&host, port, allow).await,
        Command::Call {
            addr,
            token,
            method,
            params,
            timeout,
        } => call(addr, token, &method, &params, Duration::from_secs(timeout)).await,
        Command::Attach { addr, token, retry } => {
            attach(addr, token, Duration::from_secs(retry)).await
        }
    }
}

async fn serve(host: &str, port: u16, allow: Vec<String>) -> Result<()> {
    let allow: HashSet<String> = allow.into_iter().collect();
    let config = ServerConfig::new(format!("{}:{}", host, port)).with_handshake(move |token| {
        let admitted = allow.is_empty() || allow.contains(&token);
        async move {
            if admitted {
                Ok(true)
            } else {
                Err(format!("token {} is not allowed", token))
            }
        }
    });

    let server = Server::new(config);
    handlers::register_server(&server);
    let events = server.subscribe();

    let handle = server.listen().await?;

    // Print port for scripts to read (intentional stdout)
    println!("RPC_PORT={}", handle.local_addr().port());
    info!("RPC server running on {}", handle.local_addr());

    tokio::spawn(log_events(events));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    handle.stop().await;

    Ok(())
}

async fn call(
    addr: String,
    token: String,
    method: &str,
    params: &str,
    timeout: Duration,
) -> Result<()> {
    let params: Value = serde_json::from_str(params).context("params must be valid JSON")?;

    let registry = MethodRegistry::new();
    handlers::register_common(&registry);
    let client =
        Client::connect_with(ClientConfig::new(token, addr), registry, EventBus::default()).await?;

    let result = client.call_with_timeout(method, params, timeout).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    client.close();
    Ok(())
}

async fn attach(addr: String, token: String, retry: Duration) -> Result<()> {
    let config = ClientConfig::new(token, addr)
        .with_reconnect_policy(ReconnectPolicy::fixed(retry));
    let client = ReconnectingClient::new(config);
    handlers::register_common(client.registry());

    tokio::spawn(log_events(client.subscribe()));
    client.init().await?;
    info!("Attached as {}", client.token());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, detaching");
    client.disconnect();

    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<RpcEvent>) {
    loop {
        match events.recv().await {
            Ok(RpcEvent::Connected { token }) => info!("Connected: {}", token),
            Ok(RpcEvent::Disconnected { token }) => info!("Disconnected: {}", token),
            Ok(RpcEvent::ConnectError { reason }) => warn!("Connect error: {}", reason),
            Ok(RpcEvent::ProtocolError { token, error }) => warn!(
                "Protocol error from {}: {}",
                token.as_deref().unwrap_or("<handshake>"),
                error
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Event log lagged, skipped {} events", skipped)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
